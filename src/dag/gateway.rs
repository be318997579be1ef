//! The Gateway-API processor.
//!
//! gantry programs the HTTPRoutes bound (via parentRefs) to the one
//! Gateway named in its configuration. Hostnames become virtual hosts;
//! each match in a rule becomes one route sharing the rule's backends.

use std::sync::Arc;

use gateway_api::apis::standard::httproutes::{
    HTTPRoute, HTTPRouteRulesMatchesHeadersType, HTTPRouteRulesMatchesPathType,
    HTTPRouteRulesMatchesQueryParamsType,
};
use kube::ResourceExt;

use crate::cache::{Kind, ObjectKey};
use crate::dag::builder::{generation, BuildContext, PortRef};
use crate::dag::{
    Cluster, HeaderMatch, HeaderMatchKind, LbPolicy, PathMatch, QueryParamMatch,
    QueryParamMatchKind, Reason, Route, WeightedCluster,
};

impl BuildContext<'_> {
    pub(super) fn process_gateway_routes(&mut self) {
        let snapshot = self.snapshot;
        let Some(gateway_ref) = &self.config.gateway_ref else {
            return;
        };

        let Some(gateway) = snapshot.gateways.get(gateway_ref) else {
            // the configured gateway isn't in the cluster; routes bound
            // to it stay unprogrammed until it shows up.
            return;
        };
        self.statuses.register(
            Kind::Gateway,
            gateway_ref.clone(),
            generation(gateway.as_ref()),
        );

        for (key, route) in &snapshot.httproutes {
            if !binds_to(route.as_ref(), gateway_ref) {
                continue;
            }
            self.statuses
                .register(Kind::HTTPRoute, key.clone(), generation(route.as_ref()));
            self.process_httproute(key, route.as_ref());
        }
    }

    fn process_httproute(&mut self, key: &ObjectKey, route: &HTTPRoute) {
        let gen = generation(route);

        let hostnames: Vec<String> = match &route.spec.hostnames {
            Some(hostnames) if !hostnames.is_empty() => hostnames.clone(),
            // a route with no hostname matches every request.
            _ => vec!["*".to_string()],
        };

        let mut routes = Vec::new();
        for rule in route.spec.rules.iter().flatten() {
            let clusters = self.gateway_backends(key, gen, rule);
            if clusters.is_empty() {
                continue;
            }

            let matches = rule.matches.as_deref().unwrap_or(&[]);
            if matches.is_empty() {
                routes.push(gateway_route(
                    PathMatch::Prefix("/".to_string()),
                    Vec::new(),
                    Vec::new(),
                    clusters.clone(),
                ));
                continue;
            }

            for m in matches {
                let path = match &m.path {
                    None => PathMatch::Prefix("/".to_string()),
                    Some(path) => {
                        let value = path.value.clone().unwrap_or_else(|| "/".to_string());
                        match path.r#type {
                            Some(HTTPRouteRulesMatchesPathType::Exact) => PathMatch::Exact(value),
                            Some(HTTPRouteRulesMatchesPathType::RegularExpression) => {
                                PathMatch::Regex(value)
                            }
                            _ => PathMatch::Prefix(value),
                        }
                    }
                };

                let mut headers: Vec<HeaderMatch> = m
                    .headers
                    .iter()
                    .flatten()
                    .map(|h| HeaderMatch {
                        name: h.name.to_ascii_lowercase(),
                        kind: match h.r#type {
                            Some(HTTPRouteRulesMatchesHeadersType::RegularExpression) => {
                                HeaderMatchKind::Regex(h.value.clone())
                            }
                            _ => HeaderMatchKind::Exact(h.value.clone()),
                        },
                        invert: false,
                    })
                    .collect();

                // method matches are just a match on :method.
                if let Some(method) = &m.method {
                    headers.push(HeaderMatch {
                        name: ":method".to_string(),
                        kind: HeaderMatchKind::Exact(format!("{method:?}").to_uppercase()),
                        invert: false,
                    });
                }

                let query_params: Vec<QueryParamMatch> = m
                    .query_params
                    .iter()
                    .flatten()
                    .map(|q| QueryParamMatch {
                        name: q.name.clone(),
                        kind: match q.r#type {
                            Some(HTTPRouteRulesMatchesQueryParamsType::RegularExpression) => {
                                QueryParamMatchKind::Regex(q.value.clone())
                            }
                            _ => QueryParamMatchKind::Exact {
                                value: q.value.clone(),
                                ignore_case: false,
                            },
                        },
                    })
                    .collect();

                routes.push(gateway_route(path, headers, query_params, clusters.clone()));
            }
        }

        for hostname in hostnames {
            let vhost = self.http_vhost(&hostname);
            vhost.routes.extend(routes.iter().cloned());
        }
    }

    /// Resolve a rule's backendRefs. Unresolvable backends degrade to
    /// endpoint-less clusters, matching HTTPProxy semantics.
    fn gateway_backends(
        &mut self,
        key: &ObjectKey,
        gen: i64,
        rule: &gateway_api::apis::standard::httproutes::HTTPRouteRules,
    ) -> Vec<WeightedCluster> {
        let mut clusters = Vec::new();
        for backend in rule.backend_refs.iter().flatten() {
            // cross-namespace backends need a ReferenceGrant, which
            // gantry does not implement.
            if let Some(ns) = &backend.namespace {
                if *ns != key.namespace {
                    self.statuses.record_error(
                        Kind::HTTPRoute,
                        key.clone(),
                        gen,
                        Reason::DelegationNotPermitted,
                        format!(
                            "backendRef {}/{} crosses namespaces without a delegation",
                            ns, backend.name
                        ),
                    );
                    continue;
                }
            }

            let port = backend.port.unwrap_or(0);
            let weight = backend.weight.unwrap_or(1).max(0) as u32;

            let cluster = match self.resolve_service(
                &key.namespace,
                &backend.name,
                PortRef::Number(port),
            ) {
                Ok(resolved) => self.intern_cluster(Cluster {
                    service: ObjectKey::new(&*key.namespace, &*backend.name),
                    port: resolved.port,
                    port_name: resolved.port_name,
                    protocol: resolved.protocol.unwrap_or_default(),
                    lb_policy: LbPolicy::default(),
                    health_check: None,
                    circuit_breakers: resolved.circuit_breakers,
                    sni: None,
                    unresolved: false,
                }),
                Err(err) => {
                    self.statuses.record_error(
                        Kind::HTTPRoute,
                        key.clone(),
                        gen,
                        err.reason(),
                        format!(
                            "backendRef {}/{} port {} does not resolve",
                            key.namespace, backend.name, port
                        ),
                    );
                    self.unresolved_cluster(&key.namespace, &backend.name, port)
                }
            };
            clusters.push(WeightedCluster { cluster, weight });
        }
        clusters
    }
}

fn binds_to(route: &HTTPRoute, gateway: &ObjectKey) -> bool {
    let route_namespace = route.namespace().unwrap_or_default();
    route.spec.parent_refs.iter().flatten().any(|parent| {
        let kind_matches = parent.kind.as_deref().map_or(true, |k| k == "Gateway");
        let namespace = parent.namespace.as_deref().unwrap_or(&route_namespace);
        kind_matches && parent.name == gateway.name && namespace == gateway.namespace
    })
}

fn gateway_route(
    path: PathMatch,
    headers: Vec<HeaderMatch>,
    query_params: Vec<QueryParamMatch>,
    clusters: Vec<WeightedCluster>,
) -> Route {
    Route {
        path,
        headers,
        query_params,
        clusters,
        mirror: None,
        timeout_policy: Default::default(),
        retry_policy: None,
        prefix_rewrite: None,
        request_headers: Default::default(),
        response_headers: Default::default(),
        rate_limit: None,
        cors: None,
        websocket: false,
        https_upgrade: false,
        auth_disabled: false,
    }
}
