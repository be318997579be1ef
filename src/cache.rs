//! The object cache: the latest observed copy of every watched Kubernetes
//! object, after scoping filters.
//!
//! The cache sits between the watch plumbing in [`crate::k8s`] and the DAG
//! builder. A single writer (the event fan-in task) mutates it; the
//! coalescer takes cheap snapshots of it for rebuilds. Inserting an object
//! that is already present overwrites it; there is no duplicate-key error
//! by design of the Kubernetes watch protocol.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use crate::apis::{
    HTTPProxy, TLSCertificateDelegation, DEFAULT_INGRESS_CLASS, GANTRY_CLASS_ANNOTATION,
    INGRESS_CLASS_ANNOTATION,
};
use crate::k8s::namespace_and_name;

/// `namespace/name` identity of an object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub(crate) fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn from_obj<K: kube::Resource>(obj: &K) -> Result<Self, CacheError> {
        let (namespace, name) = namespace_and_name(obj).ok_or(CacheError::InvalidObject(
            "object has no namespace/name".to_string(),
        ))?;
        Ok(Self::new(namespace, name))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Kind {
    Service,
    Endpoints,
    Secret,
    Ingress,
    HTTPProxy,
    TLSCertificateDelegation,
    Gateway,
    HTTPRoute,
}

/// A watched object, ready for classification.
#[derive(Clone, Debug)]
pub(crate) enum KubeObject {
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    Secret(Arc<Secret>),
    Ingress(Arc<Ingress>),
    HTTPProxy(Arc<HTTPProxy>),
    TLSCertificateDelegation(Arc<TLSCertificateDelegation>),
    Gateway(Arc<gateway_api::apis::standard::gateways::Gateway>),
    HTTPRoute(Arc<gateway_api::apis::standard::httproutes::HTTPRoute>),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CacheError {
    #[error("invalid object: {0}")]
    InvalidObject(String),
}

/// One owner of a reference into the secret/service indices.
type Owner = (Kind, ObjectKey);

#[derive(Default)]
pub(crate) struct KubernetesCache {
    ingress_class: Option<String>,
    root_namespaces: Vec<String>,

    services: BTreeMap<ObjectKey, Arc<Service>>,
    endpoints: BTreeMap<ObjectKey, Arc<Endpoints>>,
    secrets: BTreeMap<ObjectKey, Arc<Secret>>,
    ingresses: BTreeMap<ObjectKey, Arc<Ingress>>,
    proxies: BTreeMap<ObjectKey, Arc<HTTPProxy>>,
    delegations: BTreeMap<ObjectKey, Arc<TLSCertificateDelegation>>,
    gateways: BTreeMap<ObjectKey, Arc<gateway_api::apis::standard::gateways::Gateway>>,
    httproutes: BTreeMap<ObjectKey, Arc<gateway_api::apis::standard::httproutes::HTTPRoute>>,

    /// Root proxies rejected by the root-namespace filter. They are not
    /// part of the graph but still owe their owners a status condition.
    rejected_roots: BTreeMap<ObjectKey, Arc<HTTPProxy>>,

    /// secret key -> owners referencing it for TLS.
    secret_refs: HashMap<ObjectKey, HashSet<Owner>>,
    /// service key -> owners routing to it.
    service_refs: HashMap<ObjectKey, HashSet<Owner>>,
    /// owner -> (secrets, services) it references, for index cleanup.
    owner_refs: HashMap<Owner, (Vec<ObjectKey>, Vec<ObjectKey>)>,
}

impl KubernetesCache {
    pub(crate) fn new(ingress_class: Option<String>, root_namespaces: Vec<String>) -> Self {
        Self {
            ingress_class,
            root_namespaces,
            ..Default::default()
        }
    }

    /// Insert an object, overwriting any previous copy. Returns true when
    /// the object is interesting enough to warrant a rebuild.
    pub(crate) fn insert(&mut self, obj: KubeObject) -> Result<bool, CacheError> {
        match obj {
            KubeObject::Service(svc) => {
                let key = ObjectKey::from_obj(svc.as_ref())?;
                let interesting = self.service_refs.contains_key(&key);
                self.services.insert(key, svc);
                Ok(interesting)
            }
            KubeObject::Endpoints(ep) => {
                let key = ObjectKey::from_obj(ep.as_ref())?;
                let interesting = self.service_refs.contains_key(&key);
                self.endpoints.insert(key, ep);
                Ok(interesting)
            }
            KubeObject::Secret(secret) => {
                let key = ObjectKey::from_obj(secret.as_ref())?;
                let interesting = self.secret_refs.contains_key(&key);
                self.secrets.insert(key, secret);
                Ok(interesting)
            }
            KubeObject::Ingress(ing) => {
                let key = ObjectKey::from_obj(ing.as_ref())?;
                if !self.class_matches(ingress_class_of(ing.as_ref())) {
                    // a class change can orphan a previously admitted
                    // object. removing is the only safe response.
                    return Ok(self.forget(Kind::Ingress, &key));
                }
                self.reindex(
                    (Kind::Ingress, key.clone()),
                    ingress_secret_refs(ing.as_ref()),
                    ingress_service_refs(ing.as_ref()),
                );
                self.ingresses.insert(key, ing);
                Ok(true)
            }
            KubeObject::HTTPProxy(proxy) => {
                let key = ObjectKey::from_obj(proxy.as_ref())?;
                let class = proxy
                    .spec
                    .ingress_class_name
                    .clone()
                    .or_else(|| ingress_class_of(proxy.as_ref()));
                if !self.class_matches(class) {
                    return Ok(self.forget(Kind::HTTPProxy, &key));
                }
                if proxy.is_root() && !self.root_namespace_allowed(&key.namespace) {
                    self.forget(Kind::HTTPProxy, &key);
                    self.rejected_roots.insert(key, proxy);
                    return Ok(true);
                }
                self.rejected_roots.remove(&key);
                self.reindex(
                    (Kind::HTTPProxy, key.clone()),
                    proxy_secret_refs(proxy.as_ref()),
                    proxy_service_refs(proxy.as_ref()),
                );
                self.proxies.insert(key, proxy);
                Ok(true)
            }
            KubeObject::TLSCertificateDelegation(d) => {
                let key = ObjectKey::from_obj(d.as_ref())?;
                self.delegations.insert(key, d);
                Ok(true)
            }
            KubeObject::Gateway(gw) => {
                let key = ObjectKey::from_obj(gw.as_ref())?;
                self.gateways.insert(key, gw);
                Ok(true)
            }
            KubeObject::HTTPRoute(route) => {
                let key = ObjectKey::from_obj(route.as_ref())?;
                self.reindex(
                    (Kind::HTTPRoute, key.clone()),
                    Vec::new(),
                    httproute_service_refs(route.as_ref()),
                );
                self.httproutes.insert(key, route);
                Ok(true)
            }
        }
    }

    /// Remove an object by kind and key. Returns true if anything was
    /// actually dropped.
    pub(crate) fn remove(&mut self, kind: Kind, key: &ObjectKey) -> bool {
        match kind {
            Kind::Service => self.services.remove(key).is_some(),
            Kind::Endpoints => self.endpoints.remove(key).is_some(),
            Kind::Secret => self.secrets.remove(key).is_some(),
            Kind::Ingress
            | Kind::HTTPProxy
            | Kind::TLSCertificateDelegation
            | Kind::Gateway
            | Kind::HTTPRoute => self.forget(kind, key),
        }
    }

    /// The keys currently cached for a kind. Used by the fan-in to
    /// reconcile after it falls behind a watch.
    pub(crate) fn keys(&self, kind: Kind) -> Vec<ObjectKey> {
        match kind {
            Kind::Service => self.services.keys().cloned().collect(),
            Kind::Endpoints => self.endpoints.keys().cloned().collect(),
            Kind::Secret => self.secrets.keys().cloned().collect(),
            Kind::Ingress => self.ingresses.keys().cloned().collect(),
            Kind::HTTPProxy => self
                .proxies
                .keys()
                .chain(self.rejected_roots.keys())
                .cloned()
                .collect(),
            Kind::TLSCertificateDelegation => self.delegations.keys().cloned().collect(),
            Kind::Gateway => self.gateways.keys().cloned().collect(),
            Kind::HTTPRoute => self.httproutes.keys().cloned().collect(),
        }
    }

    /// Snapshot the cache contents for a rebuild. Values are `Arc`s, so
    /// this clones maps, not objects.
    pub(crate) fn contents(&self) -> CacheSnapshot {
        CacheSnapshot {
            services: self.services.clone(),
            endpoints: self.endpoints.clone(),
            secrets: self.secrets.clone(),
            ingresses: self.ingresses.clone(),
            proxies: self.proxies.clone(),
            delegations: self.delegations.clone(),
            gateways: self.gateways.clone(),
            httproutes: self.httproutes.clone(),
            rejected_roots: self.rejected_roots.clone(),
        }
    }

    fn forget(&mut self, kind: Kind, key: &ObjectKey) -> bool {
        self.drop_refs(&(kind, key.clone()));
        match kind {
            Kind::Ingress => self.ingresses.remove(key).is_some(),
            Kind::HTTPProxy => {
                let had_proxy = self.proxies.remove(key).is_some();
                self.rejected_roots.remove(key).is_some() || had_proxy
            }
            Kind::TLSCertificateDelegation => self.delegations.remove(key).is_some(),
            Kind::Gateway => self.gateways.remove(key).is_some(),
            Kind::HTTPRoute => self.httproutes.remove(key).is_some(),
            _ => false,
        }
    }

    fn class_matches(&self, class: Option<String>) -> bool {
        match class {
            // an unannotated object only belongs to a controller running
            // without a configured class. once a class is configured,
            // objects have to name it.
            None => self.ingress_class.is_none(),
            Some(c) => {
                let configured = self.ingress_class.as_deref().unwrap_or(DEFAULT_INGRESS_CLASS);
                c == configured
            }
        }
    }

    fn root_namespace_allowed(&self, namespace: &str) -> bool {
        self.root_namespaces.is_empty() || self.root_namespaces.iter().any(|ns| ns == namespace)
    }

    fn reindex(&mut self, owner: Owner, secrets: Vec<ObjectKey>, services: Vec<ObjectKey>) {
        self.drop_refs(&owner);
        for s in &secrets {
            self.secret_refs.entry(s.clone()).or_default().insert(owner.clone());
        }
        for s in &services {
            self.service_refs.entry(s.clone()).or_default().insert(owner.clone());
        }
        self.owner_refs.insert(owner, (secrets, services));
    }

    fn drop_refs(&mut self, owner: &Owner) {
        let Some((secrets, services)) = self.owner_refs.remove(owner) else {
            return;
        };
        for s in secrets {
            if let Some(owners) = self.secret_refs.get_mut(&s) {
                owners.remove(owner);
                if owners.is_empty() {
                    self.secret_refs.remove(&s);
                }
            }
        }
        for s in services {
            if let Some(owners) = self.service_refs.get_mut(&s) {
                owners.remove(owner);
                if owners.is_empty() {
                    self.service_refs.remove(&s);
                }
            }
        }
    }
}

/// An immutable view of the cache taken at the start of a rebuild.
#[derive(Clone, Default)]
pub(crate) struct CacheSnapshot {
    pub services: BTreeMap<ObjectKey, Arc<Service>>,
    pub endpoints: BTreeMap<ObjectKey, Arc<Endpoints>>,
    pub secrets: BTreeMap<ObjectKey, Arc<Secret>>,
    pub ingresses: BTreeMap<ObjectKey, Arc<Ingress>>,
    pub proxies: BTreeMap<ObjectKey, Arc<HTTPProxy>>,
    pub delegations: BTreeMap<ObjectKey, Arc<TLSCertificateDelegation>>,
    pub gateways: BTreeMap<ObjectKey, Arc<gateway_api::apis::standard::gateways::Gateway>>,
    pub httproutes: BTreeMap<ObjectKey, Arc<gateway_api::apis::standard::httproutes::HTTPRoute>>,
    pub rejected_roots: BTreeMap<ObjectKey, Arc<HTTPProxy>>,
}

impl CacheSnapshot {
    /// True if a delegation permits `target_namespace` to use `secret`.
    pub(crate) fn delegation_permits(&self, secret: &ObjectKey, target_namespace: &str) -> bool {
        self.delegations
            .iter()
            .filter(|(key, _)| key.namespace == secret.namespace)
            .flat_map(|(_, d)| &d.spec.delegations)
            .any(|d| {
                d.secret_name == secret.name
                    && d.target_namespaces
                        .iter()
                        .any(|ns| ns == "*" || ns == target_namespace)
            })
    }
}

fn ingress_class_of<K: kube::Resource>(obj: &K) -> Option<String> {
    let annotations = obj.meta().annotations.as_ref()?;
    annotations
        .get(GANTRY_CLASS_ANNOTATION)
        .or_else(|| annotations.get(INGRESS_CLASS_ANNOTATION))
        .cloned()
}

fn ingress_secret_refs(ing: &Ingress) -> Vec<ObjectKey> {
    let namespace = ing.namespace().unwrap_or_default();
    let mut refs = Vec::new();
    let Some(spec) = &ing.spec else { return refs };
    for tls in spec.tls.iter().flatten() {
        if let Some(secret) = &tls.secret_name {
            refs.push(ObjectKey::new(namespace.clone(), secret.clone()));
        }
    }
    refs
}

fn ingress_service_refs(ing: &Ingress) -> Vec<ObjectKey> {
    let namespace = ing.namespace().unwrap_or_default();
    let mut refs = Vec::new();
    let Some(spec) = &ing.spec else { return refs };

    if let Some(backend) = &spec.default_backend {
        if let Some(svc) = &backend.service {
            refs.push(ObjectKey::new(namespace.clone(), svc.name.clone()));
        }
    }
    for rule in spec.rules.iter().flatten() {
        for path in rule.http.iter().flat_map(|http| &http.paths) {
            if let Some(svc) = &path.backend.service {
                refs.push(ObjectKey::new(namespace.clone(), svc.name.clone()));
            }
        }
    }
    refs
}

fn proxy_secret_refs(proxy: &HTTPProxy) -> Vec<ObjectKey> {
    let namespace = proxy.namespace().unwrap_or_default();
    let mut refs = Vec::new();
    if let Some(tls) = proxy.spec.virtualhost.as_ref().and_then(|v| v.tls.as_ref()) {
        if let Some(secret) = &tls.secret_name {
            refs.push(secret_key(secret, &namespace));
        }
        if let Some(validation) = &tls.client_validation {
            refs.push(secret_key(&validation.ca_secret, &namespace));
        }
    }
    refs
}

/// Secret references may be `name` or `namespace/name`.
pub(crate) fn secret_key(reference: &str, default_namespace: &str) -> ObjectKey {
    match reference.split_once('/') {
        Some((namespace, name)) => ObjectKey::new(namespace, name),
        None => ObjectKey::new(default_namespace, reference),
    }
}

fn proxy_service_refs(proxy: &HTTPProxy) -> Vec<ObjectKey> {
    let namespace = proxy.namespace().unwrap_or_default();
    let mut refs = Vec::new();
    for route in &proxy.spec.routes {
        for svc in &route.services {
            refs.push(ObjectKey::new(namespace.clone(), svc.name.clone()));
        }
    }
    if let Some(tcp) = &proxy.spec.tcpproxy {
        for svc in &tcp.services {
            refs.push(ObjectKey::new(namespace.clone(), svc.name.clone()));
        }
    }
    refs
}

fn httproute_service_refs(
    route: &gateway_api::apis::standard::httproutes::HTTPRoute,
) -> Vec<ObjectKey> {
    let namespace = route.namespace().unwrap_or_default();
    let mut refs = Vec::new();
    for rule in route.spec.rules.iter().flatten() {
        for backend in rule.backend_refs.iter().flatten() {
            let ns = backend.namespace.clone().unwrap_or_else(|| namespace.clone());
            refs.push(ObjectKey::new(ns, backend.name.clone()));
        }
    }
    refs
}

#[cfg(test)]
mod test {
    use super::*;

    fn service(namespace: &str, name: &str, port: i32) -> Arc<Service> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"namespace": namespace, "name": name},
                "spec": {"ports": [{"port": port}]},
            }))
            .unwrap(),
        )
    }

    fn root_proxy(namespace: &str, name: &str, fqdn: &str, svc: &str) -> Arc<HTTPProxy> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "apiVersion": "gantry.dev/v1",
                "kind": "HTTPProxy",
                "metadata": {"namespace": namespace, "name": name},
                "spec": {
                    "virtualhost": {"fqdn": fqdn},
                    "routes": [{"services": [{"name": svc, "port": 80}]}],
                },
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_insert_overwrites() {
        let mut cache = KubernetesCache::default();

        cache.insert(KubeObject::Service(service("default", "web", 80))).unwrap();
        cache.insert(KubeObject::Service(service("default", "web", 8080))).unwrap();

        let snapshot = cache.contents();
        assert_eq!(snapshot.services.len(), 1);
        let svc = &snapshot.services[&ObjectKey::new("default", "web")];
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 8080);
    }

    #[test]
    fn test_unreferenced_service_is_uninteresting() {
        let mut cache = KubernetesCache::default();

        let interesting = cache
            .insert(KubeObject::Service(service("default", "web", 80)))
            .unwrap();
        assert!(!interesting, "nothing references this service yet");

        cache
            .insert(KubeObject::HTTPProxy(root_proxy("default", "p", "a.example.com", "web")))
            .unwrap();
        let interesting = cache
            .insert(KubeObject::Service(service("default", "web", 80)))
            .unwrap();
        assert!(interesting, "a root now routes to this service");
    }

    fn ingress_with_class(name: &str, class: Option<&str>) -> Arc<Ingress> {
        let annotations = match class {
            Some(class) => serde_json::json!({"kubernetes.io/ingress.class": class}),
            None => serde_json::json!({}),
        };
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {
                    "namespace": "default",
                    "name": name,
                    "annotations": annotations,
                },
                "spec": {},
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_ingress_class_filter() {
        let mut cache = KubernetesCache::new(Some("gantry".to_string()), Vec::new());

        cache
            .insert(KubeObject::Ingress(ingress_with_class("other", Some("nginx"))))
            .unwrap();
        assert!(cache.contents().ingresses.is_empty());

        // once a class is configured, an unannotated object belongs to
        // someone else.
        cache
            .insert(KubeObject::Ingress(ingress_with_class("unclassed", None)))
            .unwrap();
        assert!(cache.contents().ingresses.is_empty());

        cache
            .insert(KubeObject::Ingress(ingress_with_class("ours", Some("gantry"))))
            .unwrap();
        assert_eq!(cache.contents().ingresses.len(), 1);
    }

    #[test]
    fn test_no_configured_class_admits_unannotated_and_default() {
        let mut cache = KubernetesCache::default();

        cache
            .insert(KubeObject::Ingress(ingress_with_class("unclassed", None)))
            .unwrap();
        cache
            .insert(KubeObject::Ingress(ingress_with_class("default-class", Some("gantry"))))
            .unwrap();
        cache
            .insert(KubeObject::Ingress(ingress_with_class("other", Some("nginx"))))
            .unwrap();

        assert_eq!(cache.contents().ingresses.len(), 2);
    }

    #[test]
    fn test_root_namespace_filter() {
        let mut cache = KubernetesCache::new(None, vec!["roots".to_string()]);

        cache
            .insert(KubeObject::HTTPProxy(root_proxy("default", "p", "a.example.com", "web")))
            .unwrap();

        let snapshot = cache.contents();
        assert!(snapshot.proxies.is_empty());
        assert_eq!(snapshot.rejected_roots.len(), 1, "rejection still owes a status");

        cache
            .insert(KubeObject::HTTPProxy(root_proxy("roots", "p", "a.example.com", "web")))
            .unwrap();
        assert_eq!(cache.contents().proxies.len(), 1);
    }

    #[test]
    fn test_remove_cleans_indices() {
        let mut cache = KubernetesCache::default();
        let proxy = root_proxy("default", "p", "a.example.com", "web");
        cache.insert(KubeObject::HTTPProxy(proxy)).unwrap();

        assert!(cache.remove(Kind::HTTPProxy, &ObjectKey::new("default", "p")));
        assert!(!cache.remove(Kind::HTTPProxy, &ObjectKey::new("default", "p")));

        let interesting = cache
            .insert(KubeObject::Service(service("default", "web", 80)))
            .unwrap();
        assert!(!interesting, "removing the proxy should drop its service refs");
    }

    #[test]
    fn test_delegation_permits() {
        let mut cache = KubernetesCache::default();
        let delegation: Arc<TLSCertificateDelegation> = Arc::new(
            serde_json::from_value(serde_json::json!({
                "apiVersion": "gantry.dev/v1",
                "kind": "TLSCertificateDelegation",
                "metadata": {"namespace": "certs", "name": "wildcard"},
                "spec": {
                    "delegations": [{
                        "secretName": "wildcard-cert",
                        "targetNamespaces": ["default"],
                    }],
                },
            }))
            .unwrap(),
        );
        cache.insert(KubeObject::TLSCertificateDelegation(delegation)).unwrap();

        let snapshot = cache.contents();
        let secret = ObjectKey::new("certs", "wildcard-cert");
        assert!(snapshot.delegation_permits(&secret, "default"));
        assert!(!snapshot.delegation_permits(&secret, "other"));
        assert!(!snapshot.delegation_permits(&ObjectKey::new("certs", "nope"), "default"));
    }
}
