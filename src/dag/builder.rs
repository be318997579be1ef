//! The DAG builder: a pure function from a cache snapshot to a validated
//! graph plus per-object status conditions.
//!
//! A build never fails as a whole. Invalid objects lose their subtrees and
//! gain status conditions; everything else is published. Processors run in
//! a fixed order (Ingress, HTTPProxy, Gateway API) and share the interning
//! tables on [`BuildContext`], so a Service referenced from all three
//! appears as a single cluster.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cache::{CacheSnapshot, Kind, ObjectKey};
use crate::dag::{
    secrets, Cluster, FilterChain, HealthCheck, Listener, PathMatch, Protocol, Reason, Route,
    SecureVirtualHost, StatusMap, TlsSecret, TlsVersion, VirtualHost, HTTPS_LISTENER_NAME,
    HTTP_LISTENER_NAME,
};

/// Upstream protocol annotation prefix: the value of
/// `gantry.dev/upstream-protocol.h2c` is a comma separated list of port
/// names and numbers that speak h2c.
const UPSTREAM_PROTOCOL_ANNOTATION: &str = "gantry.dev/upstream-protocol.";

/// Objects may opt their vhost out of plain HTTP entirely.
const ALLOW_HTTP_ANNOTATION: &str = "gantry.dev/allow-http";

/// Envoy object names longer than this get hashed down.
const MAX_CLUSTER_NAME_LEN: usize = 60;

#[derive(Clone, Debug)]
pub(crate) struct BuilderConfig {
    /// Global floor for per-vhost minimum TLS versions.
    pub minimum_tls_version: TlsVersion,
    /// `namespace/name` of the fallback certificate secret, if the
    /// operator configured one.
    pub fallback_certificate: Option<ObjectKey>,
    /// Bound on HTTPProxy include chains.
    pub max_include_depth: usize,
    /// The Gateway whose HTTPRoutes gantry programs.
    pub gateway_ref: Option<ObjectKey>,
    pub http_address: String,
    pub http_port: u16,
    pub https_address: String,
    pub https_port: u16,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            minimum_tls_version: TlsVersion::V1_2,
            fallback_certificate: None,
            max_include_depth: 100,
            gateway_ref: None,
            http_address: "0.0.0.0".to_string(),
            http_port: 8080,
            https_address: "0.0.0.0".to_string(),
            https_port: 8443,
        }
    }
}

/// The output graph of one build.
#[derive(Clone, Debug, Default)]
pub(crate) struct Dag {
    pub http_hosts: BTreeMap<String, VirtualHost>,
    pub https_hosts: BTreeMap<String, SecureVirtualHost>,
    /// Every cluster referenced by any route or TCP proxy, keyed by its
    /// (deterministic) envoy name.
    pub clusters: BTreeMap<String, Arc<Cluster>>,
    pub listeners: Vec<Listener>,
    pub fallback_certificate: Option<Arc<TlsSecret>>,
}

pub(crate) struct Builder {
    config: BuilderConfig,
}

impl Builder {
    pub(crate) fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Produce a consistent DAG and a complete status map from a
    /// snapshot. Never fails; never mutates the snapshot.
    pub(crate) fn build(&self, snapshot: &CacheSnapshot) -> (Dag, StatusMap) {
        let mut ctx = BuildContext {
            snapshot,
            config: &self.config,
            statuses: StatusMap::default(),
            http_hosts: BTreeMap::new(),
            https_hosts: BTreeMap::new(),
            clusters: BTreeMap::new(),
            secrets: BTreeMap::new(),
            reached: HashSet::new(),
        };

        // root proxies rejected by the namespace filter still get a status.
        for (key, proxy) in &snapshot.rejected_roots {
            ctx.statuses.record_error(
                Kind::HTTPProxy,
                key.clone(),
                generation(proxy.as_ref()),
                Reason::RootProxyNotAllowedInNamespace,
                format!(
                    "root HTTPProxy is not allowed in namespace {:?}",
                    key.namespace
                ),
            );
        }

        ctx.process_ingresses();
        ctx.process_httpproxies();
        ctx.process_gateway_routes();

        ctx.finish()
    }
}

/// Shared state for one build.
pub(super) struct BuildContext<'a> {
    pub snapshot: &'a CacheSnapshot,
    pub config: &'a BuilderConfig,
    pub statuses: StatusMap,
    pub http_hosts: BTreeMap<String, VirtualHost>,
    pub https_hosts: BTreeMap<String, SecureVirtualHost>,
    pub clusters: BTreeMap<String, Arc<Cluster>>,
    pub secrets: BTreeMap<ObjectKey, Arc<TlsSecret>>,
    /// Non-root proxies reached through some include chain. Everything
    /// else is orphaned.
    pub reached: HashSet<ObjectKey>,
}

/// A service port reference, by number or by name.
#[derive(Clone, Copy, Debug)]
pub(super) enum PortRef<'a> {
    Number(i32),
    Name(&'a str),
}

#[derive(Debug)]
pub(super) enum ResolveError {
    ServiceNotFound,
    PortNotFound,
    PortInvalid,
}

impl ResolveError {
    pub(super) fn reason(&self) -> Reason {
        match self {
            ResolveError::ServiceNotFound | ResolveError::PortNotFound => {
                Reason::ServiceUnresolvedReference
            }
            ResolveError::PortInvalid => Reason::ServicePortInvalid,
        }
    }
}

pub(super) struct ResolvedService {
    pub port: i32,
    pub port_name: Option<String>,
    pub protocol: Option<Protocol>,
    pub circuit_breakers: crate::dag::CircuitBreakers,
}

impl<'a> BuildContext<'a> {
    /// Resolve `(namespace, service, port)` against the snapshot.
    pub(super) fn resolve_service(
        &self,
        namespace: &str,
        name: &str,
        port: PortRef,
    ) -> Result<ResolvedService, ResolveError> {
        if let PortRef::Number(n) = port {
            if n <= 0 || n > u16::MAX as i32 {
                return Err(ResolveError::PortInvalid);
            }
        }

        let key = ObjectKey::new(namespace, name);
        let svc = self.snapshot.services.get(&key).ok_or(ResolveError::ServiceNotFound)?;

        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .ok_or(ResolveError::PortNotFound)?;

        let matched = ports
            .iter()
            .find(|p| match port {
                PortRef::Number(n) => p.port == n,
                PortRef::Name(wanted) => p.name.as_deref() == Some(wanted),
            })
            .ok_or(ResolveError::PortNotFound)?;

        let protocol = upstream_protocol(svc.as_ref(), matched);
        let circuit_breakers = circuit_breakers(svc.as_ref());

        Ok(ResolvedService {
            port: matched.port,
            port_name: matched.name.clone(),
            protocol,
            circuit_breakers,
        })
    }

    /// Intern a cluster, returning the shared node for its identity.
    pub(super) fn intern_cluster(&mut self, cluster: Cluster) -> Arc<Cluster> {
        let name = cluster_name(&cluster);
        if let Some(existing) = self.clusters.get(&name) {
            return Arc::clone(existing);
        }
        let cluster = Arc::new(cluster);
        self.clusters.insert(name, Arc::clone(&cluster));
        cluster
    }

    /// A placeholder cluster for an unresolvable service reference. It is
    /// still programmed (with no endpoints) so requests get 503 instead
    /// of 404.
    pub(super) fn unresolved_cluster(&mut self, namespace: &str, name: &str, port: i32) -> Arc<Cluster> {
        self.intern_cluster(Cluster {
            service: ObjectKey::new(namespace, name),
            port,
            port_name: None,
            protocol: Protocol::default(),
            lb_policy: Default::default(),
            health_check: None,
            circuit_breakers: Default::default(),
            sni: None,
            unresolved: true,
        })
    }

    /// Look up and validate a TLS secret, memoizing the result for the
    /// build.
    pub(super) fn tls_secret(&mut self, key: &ObjectKey) -> Result<Arc<TlsSecret>, String> {
        if let Some(secret) = self.secrets.get(key) {
            return Ok(Arc::clone(secret));
        }
        let raw = self
            .snapshot
            .secrets
            .get(key)
            .ok_or_else(|| format!("secret {key} not found"))?;
        let validated = secrets::tls_secret(key.clone(), raw.as_ref())
            .map_err(|err| format!("secret {key} is not valid: {err}"))?;
        let validated = Arc::new(validated);
        self.secrets.insert(key.clone(), Arc::clone(&validated));
        Ok(validated)
    }

    pub(super) fn ca_secret(&mut self, key: &ObjectKey) -> Result<Arc<TlsSecret>, String> {
        // CA bundles are memoized under the same key space; a secret used
        // both ways parses the same either way.
        if let Some(secret) = self.secrets.get(key) {
            return Ok(Arc::clone(secret));
        }
        let raw = self
            .snapshot
            .secrets
            .get(key)
            .ok_or_else(|| format!("secret {key} not found"))?;
        let validated = secrets::ca_secret(key.clone(), raw.as_ref())
            .map_err(|err| format!("secret {key} is not valid: {err}"))?;
        let validated = Arc::new(validated);
        self.secrets.insert(key.clone(), Arc::clone(&validated));
        Ok(validated)
    }

    pub(super) fn http_vhost(&mut self, fqdn: &str) -> &mut VirtualHost {
        self.http_hosts
            .entry(fqdn.to_string())
            .or_insert_with(|| VirtualHost {
                fqdn: fqdn.to_string(),
                routes: Vec::new(),
            })
    }

    /// Finish the build: order routes, synthesize listeners, resolve the
    /// fallback certificate.
    fn finish(mut self) -> (Dag, StatusMap) {
        for vhost in self.http_hosts.values_mut() {
            sort_routes(&mut vhost.routes);
        }
        for vhost in self.https_hosts.values_mut() {
            sort_routes(&mut vhost.vhost.routes);
        }

        // drop HTTP vhosts that ended up with no routes (e.g. TLS hosts
        // that opted out of plain HTTP).
        self.http_hosts.retain(|_, vhost| !vhost.routes.is_empty());

        // clusters interned by subtrees that later turned out invalid
        // must not leak into CDS: keep only clusters some surviving
        // route or tcpproxy references.
        let mut live: HashSet<String> = HashSet::new();
        fn mark(route: &Route, live: &mut HashSet<String>) {
            for weighted in &route.clusters {
                live.insert(cluster_name(&weighted.cluster));
            }
            if let Some(mirror) = &route.mirror {
                live.insert(cluster_name(mirror));
            }
        }
        for vhost in self.http_hosts.values() {
            for route in &vhost.routes {
                mark(route, &mut live);
            }
        }
        for host in self.https_hosts.values() {
            for route in &host.vhost.routes {
                mark(route, &mut live);
            }
            if let Some(tcp) = &host.tcp_proxy {
                for weighted in &tcp.clusters {
                    live.insert(cluster_name(&weighted.cluster));
                }
            }
        }
        self.clusters.retain(|name, _| live.contains(name));

        let fallback_key = self.config.fallback_certificate.clone();
        let wants_fallback = self.https_hosts.values().any(|h| h.fallback_certificate);
        let fallback_certificate = match fallback_key {
            Some(key) if wants_fallback => self.tls_secret(&key).ok(),
            _ => None,
        };

        let mut listeners = Vec::new();
        if !self.http_hosts.is_empty() {
            listeners.push(Listener {
                name: HTTP_LISTENER_NAME,
                address: self.config.http_address.clone(),
                port: self.config.http_port,
                filter_chains: Vec::new(),
            });
        }
        if !self.https_hosts.is_empty() {
            let filter_chains = self
                .https_hosts
                .values()
                .map(|host| FilterChain {
                    server_name: host.vhost.fqdn.clone(),
                    host: host.clone(),
                })
                .collect();
            listeners.push(Listener {
                name: HTTPS_LISTENER_NAME,
                address: self.config.https_address.clone(),
                port: self.config.https_port,
                filter_chains,
            });
        }

        let dag = Dag {
            http_hosts: self.http_hosts,
            https_hosts: self.https_hosts,
            clusters: self.clusters,
            listeners,
            fallback_certificate,
        };
        (dag, self.statuses)
    }
}

pub(super) fn generation<K: kube::Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or(0)
}

/// True unless the object opted out of plain HTTP.
pub(super) fn http_allowed<K: kube::Resource>(obj: &K) -> bool {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(ALLOW_HTTP_ANNOTATION))
        .map(|v| v != "false")
        .unwrap_or(true)
}

/// Basic shape check for vhost FQDNs. A bare `*` is not a vhost, and a
/// wildcard may only appear as the whole leftmost label.
pub(super) fn validate_fqdn(fqdn: &str) -> Result<(), Reason> {
    if fqdn.is_empty() {
        return Err(Reason::FqdnNotSpecified);
    }
    if fqdn == "*" {
        return Err(Reason::WildcardNotAllowed);
    }
    if let Some(rest) = fqdn.strip_prefix("*.") {
        if rest.is_empty() || rest.contains('*') {
            return Err(Reason::WildcardNotAllowed);
        }
        return Ok(());
    }
    if fqdn.contains('*') {
        return Err(Reason::WildcardNotAllowed);
    }
    Ok(())
}

fn circuit_breakers(svc: &k8s_openapi::api::core::v1::Service) -> crate::dag::CircuitBreakers {
    let mut breakers = crate::dag::CircuitBreakers::default();
    let Some(annotations) = svc.metadata.annotations.as_ref() else {
        return breakers;
    };
    let parse = |key: &str| annotations.get(key).and_then(|v| v.parse().ok());
    breakers.max_connections = parse("gantry.dev/max-connections");
    breakers.max_pending_requests = parse("gantry.dev/max-pending-requests");
    breakers.max_requests = parse("gantry.dev/max-requests");
    breakers.max_retries = parse("gantry.dev/max-retries");
    breakers
}

fn upstream_protocol(
    svc: &k8s_openapi::api::core::v1::Service,
    port: &k8s_openapi::api::core::v1::ServicePort,
) -> Option<Protocol> {
    let annotations = svc.metadata.annotations.as_ref()?;
    for (proto_name, protocol) in [
        ("h2", Protocol::H2),
        ("h2c", Protocol::H2c),
        ("tls", Protocol::Tls),
    ] {
        let key = format!("{UPSTREAM_PROTOCOL_ANNOTATION}{proto_name}");
        let Some(value) = annotations.get(&key) else {
            continue;
        };
        for entry in value.split(',') {
            let entry = entry.trim();
            if entry == port.port.to_string() || Some(entry) == port.name.as_deref() {
                return Some(protocol);
            }
        }
    }
    None
}

/// The deterministic envoy name for a cluster.
///
/// `namespace/name/port` stays readable when it fits. Clusters that carry
/// extra per-route configuration (health checks, a non-default balancing
/// policy, upstream TLS) get a short attribute hash as an extra component
/// so that two routes with different policies never share a cluster name.
pub(crate) fn cluster_name(cluster: &Cluster) -> String {
    let port = cluster
        .port_name
        .clone()
        .unwrap_or_else(|| cluster.port.to_string());

    let mut parts = vec![
        cluster.service.namespace.clone(),
        cluster.service.name.clone(),
        port,
    ];

    if cluster.health_check.is_some()
        || cluster.lb_policy != Default::default()
        || cluster.protocol != Protocol::default()
        || cluster.sni.is_some()
    {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{:?}|{:?}|{:?}|{:?}",
            cluster.health_check, cluster.lb_policy, cluster.protocol, cluster.sni
        ));
        let digest = hex(&hasher.finalize());
        parts.push(digest[..8].to_string());
    }

    hashname(MAX_CLUSTER_NAME_LEN, parts)
}

/// Join `parts` with `/`, hashing components down from the tail when the
/// result would blow the length budget. The hash is derived from the
/// whole joined name so equal inputs always shorten identically.
pub(crate) fn hashname(limit: usize, parts: Vec<String>) -> String {
    const SHORTHASH: usize = 6;

    let joined = parts.join("/");
    if limit > joined.len() {
        return joined;
    }

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let hash = hex(&hasher.finalize());

    let mut parts = parts;
    let per_part = limit / parts.len().max(1);
    for n in (0..parts.len()).rev() {
        parts[n] = truncate(per_part, &parts[n], &hash[..SHORTHASH]);
        let joined = parts.join("/");
        if limit > joined.len() {
            return joined;
        }
    }

    hash[..limit.min(hash.len())].to_string()
}

fn truncate(limit: usize, s: &str, suffix: &str) -> String {
    if limit >= s.len() {
        return s.to_string();
    }
    if limit <= suffix.len() {
        return suffix[..limit.min(suffix.len())].to_string();
    }
    format!("{}-{}", &s[..limit - suffix.len() - 1], suffix)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Order routes so that more specific matches win at the proxy
/// regardless of the order objects were processed in: regex before exact
/// before prefix, longer paths first, then more (and longer) header
/// matchers first. The sort is stable, so equal routes keep input order.
pub(crate) fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        path_match_rank(&a.path)
            .cmp(&path_match_rank(&b.path))
            .then_with(|| b.path.value().len().cmp(&a.path.value().len()))
            .then_with(|| b.headers.len().cmp(&a.headers.len()))
            .then_with(|| header_match_len(b).cmp(&header_match_len(a)))
    });
}

fn path_match_rank(path: &PathMatch) -> u8 {
    match path {
        PathMatch::Regex(_) => 0,
        PathMatch::Exact(_) => 1,
        PathMatch::Prefix(_) => 2,
    }
}

fn header_match_len(route: &Route) -> usize {
    route
        .headers
        .iter()
        .map(|h| {
            h.name.len()
                + match &h.kind {
                    crate::dag::HeaderMatchKind::Exact(v)
                    | crate::dag::HeaderMatchKind::Contains(v)
                    | crate::dag::HeaderMatchKind::Regex(v) => v.len(),
                    crate::dag::HeaderMatchKind::Present => 0,
                }
        })
        .sum()
}

pub(super) fn health_check_from(policy: &crate::apis::HealthCheckPolicy) -> HealthCheck {
    use std::time::Duration;
    HealthCheck {
        path: policy.path.clone(),
        host: policy.host.clone(),
        interval: Duration::from_secs(policy.interval_seconds.unwrap_or(5).max(1) as u64),
        timeout: Duration::from_secs(policy.timeout_seconds.unwrap_or(2).max(1) as u64),
        unhealthy_threshold: policy.unhealthy_threshold_count.unwrap_or(3).max(1),
        healthy_threshold: policy.healthy_threshold_count.unwrap_or(2).max(1),
    }
}
