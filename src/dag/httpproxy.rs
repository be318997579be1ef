//! The HTTPProxy processor: roots, the include graph, TLS resolution and
//! TCP proxying.
//!
//! Structural errors (bad conditions, broken includes, invalid policies)
//! are fatal to the root: its virtual host is not published. Unresolvable
//! service references are not fatal: the route is kept, pointed at a
//! cluster with no endpoints, and the proxy answers 503.

use std::collections::HashSet;
use std::sync::Arc;

use crate::apis::{HTTPProxy, ProxyRoute, ProxyService, TcpProxy};
use crate::cache::{secret_key, Kind, ObjectKey};
use crate::dag::builder::{generation, http_allowed, validate_fqdn, BuildContext, PortRef};
use crate::dag::conditions::Conditions;
use crate::dag::policy::{
    CorsPolicy, HeadersPolicy, RateLimitPolicy, RetryPolicy, TimeoutPolicy,
};
use crate::dag::{
    builder, Cluster, LbPolicy, Protocol, Reason, Route, SecureVirtualHost, TcpProxyErrorReason,
    TcpProxyTarget, TlsSecret, TlsVersion, VirtualHost, WeightedCluster,
};

/// How the root terminates TLS, after resolution.
enum RootTls {
    /// No TLS, or TLS that failed resolution and degraded to HTTP-only.
    None,
    /// SNI passthrough: the TLS stream goes to the tcpproxy target.
    Passthrough,
    Terminate {
        secret: Arc<TlsSecret>,
        min_tls: TlsVersion,
        client_ca: Option<Arc<TlsSecret>>,
        fallback: bool,
    },
}

/// Vhost-level policies inherited by routes that don't set their own.
struct RouteDefaults {
    cors: Option<CorsPolicy>,
    rate_limit: Option<RateLimitPolicy>,
}

/// A route plus the flags that decide how it lands in the HTTP vhost.
struct BuiltRoute {
    route: Route,
    permit_insecure: bool,
}

/// Walk failure. The condition has already been recorded; the root's
/// subtree is dropped.
struct Fatal;

impl BuildContext<'_> {
    pub(super) fn process_httpproxies(&mut self) {
        let snapshot = self.snapshot;

        for (key, proxy) in &snapshot.proxies {
            self.statuses
                .register(Kind::HTTPProxy, key.clone(), generation(proxy.as_ref()));
        }

        // two roots claiming one FQDN are both invalid.
        let mut roots_by_fqdn: std::collections::BTreeMap<&str, Vec<&ObjectKey>> =
            Default::default();
        for (key, proxy) in &snapshot.proxies {
            if let Some(vhost) = &proxy.spec.virtualhost {
                roots_by_fqdn.entry(vhost.fqdn.as_str()).or_default().push(key);
            }
        }
        let mut duplicates = HashSet::new();
        for (fqdn, keys) in &roots_by_fqdn {
            if keys.len() > 1 {
                for key in keys {
                    duplicates.insert((*key).clone());
                    let proxy = &snapshot.proxies[*key];
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        (*key).clone(),
                        generation(proxy.as_ref()),
                        Reason::DuplicateVhost,
                        format!("fqdn {fqdn:?} is claimed by multiple root HTTPProxies"),
                    );
                }
            }
        }

        for (key, proxy) in &snapshot.proxies {
            if proxy.is_root() && !duplicates.contains(key) {
                self.process_root(key, proxy.as_ref());
            }
        }

        // non-roots nobody included are orphaned, not invalid.
        for (key, proxy) in &snapshot.proxies {
            if !proxy.is_root() && !self.reached.contains(key) {
                self.statuses
                    .record_orphaned(Kind::HTTPProxy, key.clone(), generation(proxy.as_ref()));
            }
        }
    }

    fn process_root(&mut self, key: &ObjectKey, proxy: &HTTPProxy) {
        let gen = generation(proxy);
        let vhost_spec = proxy
            .spec
            .virtualhost
            .as_ref()
            .expect("process_root called on a non-root proxy");

        if let Err(reason) = validate_fqdn(&vhost_spec.fqdn) {
            self.statuses.record_error(
                Kind::HTTPProxy,
                key.clone(),
                gen,
                reason,
                format!("virtualhost fqdn {:?} is not valid", vhost_spec.fqdn),
            );
            return;
        }
        let fqdn = vhost_spec.fqdn.clone();

        if proxy.spec.routes.is_empty()
            && proxy.spec.includes.is_empty()
            && proxy.spec.tcpproxy.is_none()
        {
            self.statuses.record_error(
                Kind::HTTPProxy,
                key.clone(),
                gen,
                Reason::NothingDefined,
                "HTTPProxy defines no routes, includes or tcpproxy",
            );
            return;
        }

        let defaults = match self.parse_defaults(key, gen, vhost_spec) {
            Ok(defaults) => defaults,
            Err(Fatal) => return,
        };

        let tls = match self.resolve_root_tls(key, gen, vhost_spec) {
            Ok(tls) => tls,
            Err(Fatal) => return,
        };

        // walk the include graph, collecting leaf routes.
        let mut routes = Vec::new();
        let mut stack = vec![key.clone()];
        if self
            .walk_proxy(key, proxy, &Conditions::default(), &mut stack, &mut routes, &defaults)
            .is_err()
        {
            return;
        }

        // tcpproxy, when present, needs TLS and a resolvable target.
        let tcp_proxy = match &proxy.spec.tcpproxy {
            Some(tcp) => {
                if matches!(tls, RootTls::None) && vhost_spec.tls.is_none() {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        key.clone(),
                        gen,
                        Reason::TcpProxyError(TcpProxyErrorReason::TlsMustBeConfigured),
                        "tcpproxy requires TLS: configure virtualhost.tls with passthrough or a secret",
                    );
                    return;
                }
                let mut visited = HashSet::new();
                visited.insert(key.clone());
                match self.resolve_tcpproxy(key, &key.namespace, gen, tcp, &mut visited) {
                    Ok(target) => Some(target),
                    Err(Fatal) => return,
                }
            }
            None => None,
        };

        if matches!(tls, RootTls::Passthrough) && tcp_proxy.is_none() {
            self.statuses.record_error(
                Kind::HTTPProxy,
                key.clone(),
                gen,
                Reason::TcpProxyError(TcpProxyErrorReason::NothingDefined),
                "TLS passthrough requires a tcpproxy to carry the stream",
            );
            return;
        }

        self.publish(&fqdn, proxy, tls, tcp_proxy, routes);
    }

    fn parse_defaults(
        &mut self,
        key: &ObjectKey,
        gen: i64,
        vhost: &crate::apis::VirtualHost,
    ) -> Result<RouteDefaults, Fatal> {
        let cors = match CorsPolicy::parse(vhost.cors_policy.as_ref()) {
            Ok(cors) => cors,
            Err(err) => {
                self.statuses
                    .record_error(Kind::HTTPProxy, key.clone(), gen, err.reason, err.message);
                return Err(Fatal);
            }
        };
        let rate_limit = match RateLimitPolicy::parse(vhost.rate_limit_policy.as_ref()) {
            Ok(rl) => rl,
            Err(err) => {
                self.statuses
                    .record_error(Kind::HTTPProxy, key.clone(), gen, err.reason, err.message);
                return Err(Fatal);
            }
        };
        Ok(RouteDefaults { cors, rate_limit })
    }

    /// Resolve the root's TLS block. Structural contradictions are fatal;
    /// resolution failures (missing secret, missing delegation, bad
    /// certificate) degrade the root to HTTP-only.
    fn resolve_root_tls(
        &mut self,
        key: &ObjectKey,
        gen: i64,
        vhost: &crate::apis::VirtualHost,
    ) -> Result<RootTls, Fatal> {
        let Some(tls) = &vhost.tls else {
            return Ok(RootTls::None);
        };

        let fatal = |this: &mut Self, reason: Reason, message: String| {
            this.statuses
                .record_error(Kind::HTTPProxy, key.clone(), gen, reason, message);
            Fatal
        };

        match (tls.passthrough, &tls.secret_name) {
            (true, Some(_)) => {
                return Err(fatal(
                    self,
                    Reason::TlsConfigNotValid,
                    "tls.passthrough and tls.secretName are mutually exclusive".to_string(),
                ));
            }
            (false, None) => {
                return Err(fatal(
                    self,
                    Reason::TlsConfigNotValid,
                    "tls requires exactly one of passthrough and secretName".to_string(),
                ));
            }
            (true, None) => {
                if tls.enable_fallback_certificate {
                    return Err(fatal(
                        self,
                        Reason::FallbackNotValid,
                        "the fallback certificate cannot be combined with passthrough".to_string(),
                    ));
                }
                return Ok(RootTls::Passthrough);
            }
            (false, Some(_)) => {}
        }
        let secret_name = tls.secret_name.as_deref().expect("checked above");

        if tls.enable_fallback_certificate && tls.client_validation.is_some() {
            return Err(fatal(
                self,
                Reason::FallbackNotValid,
                "the fallback certificate cannot be combined with client certificate validation"
                    .to_string(),
            ));
        }

        // from here on, failures drop HTTPS but keep HTTP.
        let degraded = |this: &mut Self, reason: Reason, message: String| {
            this.statuses
                .record_error(Kind::HTTPProxy, key.clone(), gen, reason, message);
            RootTls::None
        };

        if tls.enable_fallback_certificate && self.config.fallback_certificate.is_none() {
            return Ok(degraded(
                self,
                Reason::FallbackNotPresent,
                "fallback certificate requested but none is configured".to_string(),
            ));
        }

        let min_tls = match &tls.minimum_protocol_version {
            None => self.config.minimum_tls_version,
            Some(v) => match TlsVersion::parse(v) {
                // the global minimum clamps upward, never downward.
                Some(version) => version.max(self.config.minimum_tls_version),
                None => {
                    return Ok(degraded(
                        self,
                        Reason::TlsConfigNotValid,
                        format!("unknown minimum TLS version {v:?}"),
                    ));
                }
            },
        };

        let secret_ref = secret_key(secret_name, &key.namespace);
        if secret_ref.namespace != key.namespace
            && !self.snapshot.delegation_permits(&secret_ref, &key.namespace)
        {
            return Ok(degraded(
                self,
                Reason::DelegationNotPermitted,
                format!(
                    "secret {secret_ref} has not been delegated to namespace {:?}",
                    key.namespace
                ),
            ));
        }
        let secret = match self.tls_secret(&secret_ref) {
            Ok(secret) => secret,
            Err(message) => return Ok(degraded(self, Reason::TlsConfigNotValid, message)),
        };

        let client_ca = match &tls.client_validation {
            None => None,
            Some(validation) => {
                let ca_ref = secret_key(&validation.ca_secret, &key.namespace);
                if ca_ref.namespace != key.namespace
                    && !self.snapshot.delegation_permits(&ca_ref, &key.namespace)
                {
                    return Ok(degraded(
                        self,
                        Reason::DelegationNotPermitted,
                        format!(
                            "secret {ca_ref} has not been delegated to namespace {:?}",
                            key.namespace
                        ),
                    ));
                }
                match self.ca_secret(&ca_ref) {
                    Ok(ca) => Some(ca),
                    Err(message) => return Ok(degraded(self, Reason::TlsConfigNotValid, message)),
                }
            }
        };

        Ok(RootTls::Terminate {
            secret,
            min_tls,
            client_ca,
            fallback: tls.enable_fallback_certificate,
        })
    }

    /// Depth-first include walk. Conditions accumulate along the chain;
    /// each proxy may be visited at most once per ancestor chain.
    fn walk_proxy(
        &mut self,
        current: &ObjectKey,
        proxy: &HTTPProxy,
        conditions: &Conditions,
        stack: &mut Vec<ObjectKey>,
        routes: &mut Vec<BuiltRoute>,
        defaults: &RouteDefaults,
    ) -> Result<(), Fatal> {
        let snapshot = self.snapshot;
        let gen = generation(proxy);

        for route in &proxy.spec.routes {
            let built = self.build_route(current, gen, route, conditions, defaults)?;
            routes.push(built);
        }

        for include in &proxy.spec.includes {
            let target_key = ObjectKey::new(
                include.namespace.as_deref().unwrap_or(&current.namespace),
                include.name.clone(),
            );

            let include_conditions = match Conditions::from_block(&include.conditions) {
                Ok(block) => block,
                Err(err) => {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        current.clone(),
                        gen,
                        err.reason(),
                        err.to_string(),
                    );
                    return Err(Fatal);
                }
            };
            let merged = match conditions.extend(&include_conditions) {
                Ok(merged) => merged,
                Err(err) => {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        current.clone(),
                        gen,
                        err.reason(),
                        err.to_string(),
                    );
                    return Err(Fatal);
                }
            };

            let Some(target) = snapshot.proxies.get(&target_key) else {
                self.statuses.record_error(
                    Kind::HTTPProxy,
                    current.clone(),
                    gen,
                    Reason::IncludeNotFound,
                    format!("include of HTTPProxy {target_key} which does not exist"),
                );
                return Err(Fatal);
            };

            if target.is_root() {
                self.statuses.record_error(
                    Kind::HTTPProxy,
                    current.clone(),
                    gen,
                    Reason::RootIncludesRoot,
                    format!("include of root HTTPProxy {target_key}"),
                );
                return Err(Fatal);
            }

            if stack.contains(&target_key) {
                // everyone on the cycle is invalid, not just the root.
                for member in stack.iter() {
                    let member_gen = snapshot
                        .proxies
                        .get(member)
                        .map(|p| generation(p.as_ref()))
                        .unwrap_or(0);
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        member.clone(),
                        member_gen,
                        Reason::IncludeCreatesCycle,
                        format!("include of HTTPProxy {target_key} creates an include cycle"),
                    );
                }
                return Err(Fatal);
            }

            if stack.len() >= self.config.max_include_depth {
                self.statuses.record_error(
                    Kind::HTTPProxy,
                    stack[0].clone(),
                    gen,
                    Reason::IncludeCreatesCycle,
                    format!(
                        "include chain exceeds the maximum depth of {}",
                        self.config.max_include_depth
                    ),
                );
                return Err(Fatal);
            }

            self.reached.insert(target_key.clone());

            stack.push(target_key.clone());
            let result =
                self.walk_proxy(&target_key, target.as_ref(), &merged, stack, routes, defaults);
            stack.pop();
            result?;
        }

        Ok(())
    }

    fn build_route(
        &mut self,
        current: &ObjectKey,
        gen: i64,
        route: &ProxyRoute,
        inherited: &Conditions,
        defaults: &RouteDefaults,
    ) -> Result<BuiltRoute, Fatal> {
        let fatal = |this: &mut Self, reason: Reason, message: String| {
            this.statuses
                .record_error(Kind::HTTPProxy, current.clone(), gen, reason, message);
            Fatal
        };

        let own = match Conditions::from_block(&route.conditions) {
            Ok(own) => own,
            Err(err) => return Err(fatal(self, err.reason(), err.to_string())),
        };
        let conditions = match inherited.extend(&own) {
            Ok(merged) => merged,
            Err(err) => return Err(fatal(self, err.reason(), err.to_string())),
        };

        if route.services.is_empty() {
            return Err(fatal(
                self,
                Reason::NothingDefined,
                "route defines no services".to_string(),
            ));
        }
        if route.services.iter().filter(|s| s.mirror).count() > 1 {
            return Err(fatal(
                self,
                Reason::OnlyOneMirror,
                "only one service per route may set mirror".to_string(),
            ));
        }

        let timeout_policy = match TimeoutPolicy::parse(route.timeout_policy.as_ref()) {
            Ok(policy) => policy,
            Err(err) => return Err(fatal(self, err.reason, err.message)),
        };
        let retry_policy = match RetryPolicy::parse(route.retry_policy.as_ref()) {
            Ok(policy) => policy,
            Err(err) => return Err(fatal(self, err.reason, err.message)),
        };
        let request_headers =
            match HeadersPolicy::parse(route.request_headers_policy.as_ref(), Reason::RequestHeadersPolicyInvalid) {
                Ok(policy) => policy,
                Err(err) => return Err(fatal(self, err.reason, err.message)),
            };
        let response_headers =
            match HeadersPolicy::parse(route.response_headers_policy.as_ref(), Reason::ResponseHeadersPolicyInvalid) {
                Ok(policy) => policy,
                Err(err) => return Err(fatal(self, err.reason, err.message)),
            };
        let rate_limit = match RateLimitPolicy::parse(route.rate_limit_policy.as_ref()) {
            Ok(policy) => policy.or(defaults.rate_limit),
            Err(err) => return Err(fatal(self, err.reason, err.message)),
        };

        let lb_policy = route
            .load_balancer_policy
            .as_ref()
            .map(|p| LbPolicy::parse(&p.strategy))
            .unwrap_or_default();
        let health_check = route.health_check_policy.as_ref().map(builder::health_check_from);

        // resolve services. unresolvable references degrade to a cluster
        // with no endpoints rather than killing the route.
        let mut clusters = Vec::new();
        let mut mirror = None;
        for svc in &route.services {
            let cluster = self.route_cluster(current, gen, svc, lb_policy, health_check.clone())?;
            if svc.mirror {
                mirror = Some(cluster);
            } else {
                clusters.push(WeightedCluster {
                    cluster,
                    weight: svc.weight.unwrap_or(1),
                });
            }
        }
        if clusters.is_empty() {
            // every non-mirror service failed to resolve, or the route
            // only named a mirror. either way there must be something to
            // route to.
            if mirror.is_some() {
                return Err(fatal(
                    self,
                    Reason::NothingDefined,
                    "a route cannot consist solely of a mirror".to_string(),
                ));
            }
            unreachable!("non-empty services always produce at least one cluster");
        }

        let prefix_rewrite = route
            .path_rewrite_policy
            .as_ref()
            .and_then(|p| p.replace_prefix.clone());

        Ok(BuiltRoute {
            route: Route {
                path: conditions.path_match(),
                headers: conditions.headers.clone(),
                query_params: conditions.query_params.clone(),
                clusters,
                mirror,
                timeout_policy,
                retry_policy,
                prefix_rewrite,
                request_headers,
                response_headers,
                rate_limit,
                cors: defaults.cors.clone(),
                websocket: route.enable_websockets,
                https_upgrade: false,
                auth_disabled: route.auth_disabled,
            },
            permit_insecure: route.permit_insecure,
        })
    }

    /// Build (and intern) the cluster for one service reference,
    /// recording a degraded condition when it doesn't resolve.
    fn route_cluster(
        &mut self,
        current: &ObjectKey,
        gen: i64,
        svc: &ProxyService,
        lb_policy: LbPolicy,
        health_check: Option<crate::dag::HealthCheck>,
    ) -> Result<Arc<Cluster>, Fatal> {
        let protocol = match &svc.protocol {
            None => None,
            Some(p) => match Protocol::parse(p) {
                Some(protocol) => Some(protocol),
                None => {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        current.clone(),
                        gen,
                        Reason::ServicePortInvalid,
                        format!("unknown protocol {p:?} on service {:?}", svc.name),
                    );
                    return Err(Fatal);
                }
            },
        };

        match self.resolve_service(&current.namespace, &svc.name, PortRef::Number(svc.port)) {
            Ok(resolved) => Ok(self.intern_cluster(Cluster {
                service: ObjectKey::new(&*current.namespace, &*svc.name),
                port: resolved.port,
                port_name: resolved.port_name,
                protocol: protocol.or(resolved.protocol).unwrap_or_default(),
                lb_policy,
                health_check,
                circuit_breakers: resolved.circuit_breakers,
                sni: None,
                unresolved: false,
            })),
            Err(err) => {
                self.statuses.record_error(
                    Kind::HTTPProxy,
                    current.clone(),
                    gen,
                    err.reason(),
                    format!(
                        "service {}/{} port {} does not resolve",
                        current.namespace, svc.name, svc.port
                    ),
                );
                Ok(self.unresolved_cluster(&current.namespace, &svc.name, svc.port))
            }
        }
    }

    fn resolve_tcpproxy(
        &mut self,
        current: &ObjectKey,
        namespace: &str,
        gen: i64,
        tcp: &TcpProxy,
        visited: &mut HashSet<ObjectKey>,
    ) -> Result<TcpProxyTarget, Fatal> {
        match (tcp.services.is_empty(), &tcp.include) {
            (false, Some(_)) => {
                self.statuses.record_error(
                    Kind::HTTPProxy,
                    current.clone(),
                    gen,
                    Reason::TcpProxyError(TcpProxyErrorReason::NoServicesAndInclude),
                    "tcpproxy cannot set both services and include",
                );
                Err(Fatal)
            }
            (true, None) => {
                self.statuses.record_error(
                    Kind::HTTPProxy,
                    current.clone(),
                    gen,
                    Reason::TcpProxyError(TcpProxyErrorReason::NothingDefined),
                    "tcpproxy must set one of services and include",
                );
                Err(Fatal)
            }
            (false, None) => {
                let mut clusters = Vec::new();
                for svc in &tcp.services {
                    match self.resolve_service(namespace, &svc.name, PortRef::Number(svc.port)) {
                        Ok(resolved) => {
                            let cluster = self.intern_cluster(Cluster {
                                service: ObjectKey::new(namespace, &*svc.name),
                                port: resolved.port,
                                port_name: resolved.port_name,
                                protocol: Protocol::default(),
                                lb_policy: LbPolicy::default(),
                                health_check: None,
                                circuit_breakers: resolved.circuit_breakers,
                                sni: None,
                                unresolved: false,
                            });
                            clusters.push(WeightedCluster {
                                cluster,
                                weight: svc.weight.unwrap_or(1),
                            });
                        }
                        Err(_) => {
                            self.statuses.record_error(
                                Kind::HTTPProxy,
                                current.clone(),
                                gen,
                                Reason::TcpProxyError(TcpProxyErrorReason::UnresolvedServiceRef),
                                format!(
                                    "tcpproxy service {namespace}/{} port {} does not resolve",
                                    svc.name, svc.port
                                ),
                            );
                            return Err(Fatal);
                        }
                    }
                }
                Ok(TcpProxyTarget { clusters })
            }
            (true, Some(include)) => {
                let target_key = ObjectKey::new(
                    include.namespace.as_deref().unwrap_or(namespace),
                    include.name.clone(),
                );

                let Some(target) = self.snapshot.proxies.get(&target_key) else {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        current.clone(),
                        gen,
                        Reason::IncludeNotFound,
                        format!("tcpproxy include of HTTPProxy {target_key} which does not exist"),
                    );
                    return Err(Fatal);
                };
                if target.is_root() {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        current.clone(),
                        gen,
                        Reason::RootIncludesRoot,
                        format!("tcpproxy include of root HTTPProxy {target_key}"),
                    );
                    return Err(Fatal);
                }
                if !visited.insert(target_key.clone()) {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        current.clone(),
                        gen,
                        Reason::IncludeCreatesCycle,
                        format!("tcpproxy include of HTTPProxy {target_key} creates a cycle"),
                    );
                    return Err(Fatal);
                }
                self.reached.insert(target_key.clone());

                let target = Arc::clone(target);
                let target_gen = generation(target.as_ref());
                let Some(target_tcp) = &target.spec.tcpproxy else {
                    self.statuses.record_error(
                        Kind::HTTPProxy,
                        target_key.clone(),
                        target_gen,
                        Reason::TcpProxyError(TcpProxyErrorReason::NothingDefined),
                        "included HTTPProxy has no tcpproxy block",
                    );
                    return Err(Fatal);
                };
                self.resolve_tcpproxy(
                    &target_key,
                    &target_key.namespace.clone(),
                    target_gen,
                    target_tcp,
                    visited,
                )
            }
        }
    }

    /// Place routes and the TLS configuration into the vhost maps.
    fn publish(
        &mut self,
        fqdn: &str,
        proxy: &HTTPProxy,
        tls: RootTls,
        tcp_proxy: Option<TcpProxyTarget>,
        routes: Vec<BuiltRoute>,
    ) {
        let allow_http = http_allowed(proxy);

        match tls {
            RootTls::None => {
                if allow_http {
                    let vhost = self.http_vhost(fqdn);
                    vhost.routes.extend(routes.into_iter().map(|r| r.route));
                }
            }
            RootTls::Passthrough => {
                self.https_hosts.insert(
                    fqdn.to_string(),
                    SecureVirtualHost {
                        vhost: VirtualHost {
                            fqdn: fqdn.to_string(),
                            routes: Vec::new(),
                        },
                        secret: None,
                        min_tls: self.config.minimum_tls_version,
                        client_ca: None,
                        fallback_certificate: false,
                        passthrough: true,
                        tcp_proxy,
                    },
                );
                if allow_http {
                    let vhost = self.http_vhost(fqdn);
                    vhost.routes.extend(routes.into_iter().map(|r| r.route));
                }
            }
            RootTls::Terminate {
                secret,
                min_tls,
                client_ca,
                fallback,
            } => {
                let secure_routes: Vec<Route> = routes.iter().map(|r| r.route.clone()).collect();
                self.https_hosts.insert(
                    fqdn.to_string(),
                    SecureVirtualHost {
                        vhost: VirtualHost {
                            fqdn: fqdn.to_string(),
                            routes: secure_routes,
                        },
                        secret: Some(secret),
                        min_tls,
                        client_ca,
                        fallback_certificate: fallback,
                        passthrough: false,
                        tcp_proxy,
                    },
                );

                if allow_http {
                    // the HTTP side either upgrades to HTTPS or, for
                    // permitInsecure routes, serves plaintext.
                    let vhost = self.http_vhost(fqdn);
                    for built in routes {
                        let mut route = built.route;
                        route.https_upgrade = !built.permit_insecure;
                        vhost.routes.push(route);
                    }
                }
            }
        }
    }
}
