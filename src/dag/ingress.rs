//! The Ingress processor.
//!
//! Ingress is the least expressive of the three root kinds: hosts, path
//! prefixes and backends, plus TLS sections binding hostnames to secrets
//! in the Ingress's own namespace. An Ingress with no host routes all
//! traffic, which lands on the catch-all `*` virtual host.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::ResourceExt;

use crate::cache::{Kind, ObjectKey};
use crate::dag::builder::{generation, http_allowed, BuildContext, PortRef};
use crate::dag::{Cluster, LbPolicy, PathMatch, Reason, Route, SecureVirtualHost, TlsSecret};

/// Standard ingress annotation: always redirect HTTP to HTTPS.
const FORCE_SSL_REDIRECT_ANNOTATION: &str = "ingress.kubernetes.io/force-ssl-redirect";

impl BuildContext<'_> {
    pub(super) fn process_ingresses(&mut self) {
        let snapshot = self.snapshot;
        for (key, ingress) in &snapshot.ingresses {
            self.statuses
                .register(Kind::Ingress, key.clone(), generation(ingress.as_ref()));
            self.process_ingress(key, ingress.as_ref());
        }
    }

    fn process_ingress(&mut self, key: &ObjectKey, ingress: &Ingress) {
        let gen = generation(ingress);
        let Some(spec) = &ingress.spec else { return };

        // hostname -> validated serving secret.
        let mut secured: BTreeMap<String, Arc<TlsSecret>> = BTreeMap::new();
        for tls in spec.tls.iter().flatten() {
            let Some(secret_name) = &tls.secret_name else {
                continue;
            };
            let secret_ref = ObjectKey::new(&*key.namespace, &**secret_name);
            match self.tls_secret(&secret_ref) {
                Ok(secret) => {
                    for host in tls.hosts.iter().flatten() {
                        secured.insert(host.clone(), Arc::clone(&secret));
                    }
                }
                Err(message) => {
                    self.statuses.record_error(
                        Kind::Ingress,
                        key.clone(),
                        gen,
                        Reason::TlsConfigNotValid,
                        message,
                    );
                }
            }
        }

        let force_redirect = ingress
            .annotations()
            .get(FORCE_SSL_REDIRECT_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false);
        let allow_http = http_allowed(ingress);

        let add_route = |this: &mut Self, host: &str, path: PathMatch, backend: &IngressBackend| {
            let Some(route) = this.ingress_route(key, gen, path, backend) else {
                return;
            };

            if let Some(secret) = secured.get(host) {
                let secure = this
                    .https_hosts
                    .entry(host.to_string())
                    .or_insert_with(|| SecureVirtualHost {
                        vhost: crate::dag::VirtualHost {
                            fqdn: host.to_string(),
                            routes: Vec::new(),
                        },
                        secret: Some(Arc::clone(secret)),
                        min_tls: this.config.minimum_tls_version,
                        client_ca: None,
                        fallback_certificate: false,
                        passthrough: false,
                        tcp_proxy: None,
                    });
                secure.vhost.routes.push(route.clone());

                if allow_http {
                    let mut http_route = route;
                    http_route.https_upgrade = force_redirect;
                    this.http_vhost(host).routes.push(http_route);
                }
            } else if allow_http {
                this.http_vhost(host).routes.push(route);
            }
        };

        // the default backend catches everything that no rule matches.
        if let Some(backend) = &spec.default_backend {
            add_route(self, "*", PathMatch::Prefix("/".to_string()), backend);
        }

        for rule in spec.rules.iter().flatten() {
            let host = match rule.host.as_deref() {
                None | Some("") => "*",
                Some(host) => host,
            };
            let Some(http) = &rule.http else { continue };
            for path in &http.paths {
                let path_match = match (path.path_type.as_str(), path.path.as_deref()) {
                    ("Exact", Some(p)) => PathMatch::Exact(p.to_string()),
                    (_, Some(p)) if !p.is_empty() => PathMatch::Prefix(p.to_string()),
                    _ => PathMatch::Prefix("/".to_string()),
                };
                add_route(self, host, path_match, &path.backend);
            }
        }
    }

    /// Build the route for one ingress backend. Returns None for
    /// backends gantry cannot express (resource backends).
    fn ingress_route(
        &mut self,
        key: &ObjectKey,
        gen: i64,
        path: PathMatch,
        backend: &IngressBackend,
    ) -> Option<Route> {
        let Some(service) = &backend.service else {
            // typed local object references (`backend.resource`) have no
            // service to route to.
            return None;
        };

        let port = service.port.as_ref();
        let port_ref = match (port.and_then(|p| p.number), port.and_then(|p| p.name.as_deref())) {
            (Some(number), _) => PortRef::Number(number),
            (None, Some(name)) => PortRef::Name(name),
            (None, None) => PortRef::Number(0),
        };

        let cluster = match self.resolve_service(&key.namespace, &service.name, port_ref) {
            Ok(resolved) => self.intern_cluster(Cluster {
                service: ObjectKey::new(&*key.namespace, &*service.name),
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
                    Kind::Ingress,
                    key.clone(),
                    gen,
                    err.reason(),
                    format!(
                        "backend service {}/{} does not resolve",
                        key.namespace, service.name
                    ),
                );
                let number = port.and_then(|p| p.number).unwrap_or(0);
                self.unresolved_cluster(&key.namespace, &service.name, number)
            }
        };

        Some(Route {
            path,
            headers: Vec::new(),
            query_params: Vec::new(),
            clusters: vec![crate::dag::WeightedCluster { cluster, weight: 1 }],
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
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::CacheSnapshot;
    use crate::dag::builder::{Builder, BuilderConfig};
    use serde_json::json;

    fn ingress(value: serde_json::Value) -> (ObjectKey, Arc<Ingress>) {
        let ingress: Ingress = serde_json::from_value(value).unwrap();
        let key = ObjectKey::new(
            ingress.metadata.namespace.clone().unwrap(),
            ingress.metadata.name.clone().unwrap(),
        );
        (key, Arc::new(ingress))
    }

    fn service(namespace: &str, name: &str, port: i32) -> (ObjectKey, Arc<k8s_openapi::api::core::v1::Service>) {
        let svc = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"namespace": namespace, "name": name},
            "spec": {"ports": [{"port": port}]},
        }))
        .unwrap();
        (ObjectKey::new(namespace, name), Arc::new(svc))
    }

    fn build(snap: &CacheSnapshot) -> (crate::dag::Dag, crate::dag::StatusMap) {
        Builder::new(BuilderConfig::default()).build(snap)
    }

    #[test]
    fn test_ingress_rules_become_routes() {
        let (svc_key, svc) = service("default", "web", 80);
        let (key, ing) = ingress(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"namespace": "default", "name": "web"},
            "spec": {
                "rules": [{
                    "host": "web.example.com",
                    "http": {"paths": [
                        {"path": "/", "pathType": "Prefix",
                         "backend": {"service": {"name": "web", "port": {"number": 80}}}},
                        {"path": "/health", "pathType": "Exact",
                         "backend": {"service": {"name": "web", "port": {"number": 80}}}},
                    ]},
                }],
            },
        }));

        let snap = CacheSnapshot {
            ingresses: [(key.clone(), ing)].into_iter().collect(),
            services: [(svc_key, svc)].into_iter().collect(),
            ..Default::default()
        };
        let (dag, statuses) = build(&snap);

        assert!(statuses.get(Kind::Ingress, &key).unwrap().is_valid());
        let vhost = &dag.http_hosts["web.example.com"];
        assert_eq!(vhost.routes.len(), 2);
        // exact sorts ahead of prefix.
        assert_eq!(vhost.routes[0].path, PathMatch::Exact("/health".to_string()));
    }

    #[test]
    fn test_ingress_without_host_is_catch_all() {
        let (svc_key, svc) = service("default", "web", 80);
        let (key, ing) = ingress(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"namespace": "default", "name": "web"},
            "spec": {
                "defaultBackend": {"service": {"name": "web", "port": {"number": 80}}},
            },
        }));

        let snap = CacheSnapshot {
            ingresses: [(key, ing)].into_iter().collect(),
            services: [(svc_key, svc)].into_iter().collect(),
            ..Default::default()
        };
        let (dag, _) = build(&snap);

        assert!(dag.http_hosts.contains_key("*"));
    }

    #[test]
    fn test_ingress_unresolved_backend_degrades() {
        let (key, ing) = ingress(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"namespace": "default", "name": "web"},
            "spec": {
                "rules": [{
                    "host": "web.example.com",
                    "http": {"paths": [
                        {"path": "/", "pathType": "Prefix",
                         "backend": {"service": {"name": "missing", "port": {"number": 80}}}},
                    ]},
                }],
            },
        }));

        let snap = CacheSnapshot {
            ingresses: [(key.clone(), ing)].into_iter().collect(),
            ..Default::default()
        };
        let (dag, statuses) = build(&snap);

        let status = statuses.get(Kind::Ingress, &key).unwrap();
        assert!(!status.is_valid());
        assert_eq!(status.errors()[0].0, Reason::ServiceUnresolvedReference);
        assert!(dag.http_hosts["web.example.com"].routes[0].clusters[0].cluster.unresolved);
    }

    #[test]
    fn test_ingress_tls_serves_both_listeners() {
        use crate::dag::fixtures::{base64 as b64, TLS_CERT, TLS_KEY};

        let (svc_key, svc) = service("default", "web", 80);
        let secret: k8s_openapi::api::core::v1::Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"namespace": "default", "name": "web-cert"},
            "type": "kubernetes.io/tls",
            "data": {
                "tls.crt": b64(TLS_CERT),
                "tls.key": b64(TLS_KEY),
            },
        }))
        .unwrap();
        let (key, ing) = ingress(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"namespace": "default", "name": "web"},
            "spec": {
                "tls": [{"hosts": ["web.example.com"], "secretName": "web-cert"}],
                "rules": [{
                    "host": "web.example.com",
                    "http": {"paths": [
                        {"path": "/", "pathType": "Prefix",
                         "backend": {"service": {"name": "web", "port": {"number": 80}}}},
                    ]},
                }],
            },
        }));

        let snap = CacheSnapshot {
            ingresses: [(key, ing)].into_iter().collect(),
            services: [(svc_key, svc)].into_iter().collect(),
            secrets: [(ObjectKey::new("default", "web-cert"), Arc::new(secret))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let (dag, _) = build(&snap);

        assert_eq!(dag.https_hosts["web.example.com"].vhost.routes.len(), 1);
        let http_route = &dag.http_hosts["web.example.com"].routes[0];
        assert!(!http_route.https_upgrade, "no redirect without the annotation");
    }
}
