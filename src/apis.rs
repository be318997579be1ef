//! CRD types for the `gantry.dev` API group.
//!
//! HTTPProxy is the root configuration object: a proxy with a `virtualhost`
//! block owns an FQDN, everything else is reachable only through includes.
//! TLSCertificateDelegation grants roots in other namespaces permission to
//! reference a TLS secret.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub(crate) const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub(crate) const GANTRY_CLASS_ANNOTATION: &str = "gantry.dev/ingress.class";

/// The ingress class gantry claims when the operator doesn't configure one.
pub(crate) const DEFAULT_INGRESS_CLASS: &str = "gantry";

#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "HTTPProxy",
    namespaced,
    status = "HTTPProxyStatus",
    shortname = "proxy"
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HTTPProxySpec {
    /// Present on root proxies only. A proxy without a virtualhost block can
    /// only be reached through an include.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<VirtualHost>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ProxyRoute>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<Include>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcpproxy: Option<TcpProxy>,

    /// Overrides the class annotation when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VirtualHost {
    pub fqdn: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors_policy: Option<CorsPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Tls {
    /// `name` or `namespace/name` of a kubernetes.io/tls secret. Cross
    /// namespace references require a TLSCertificateDelegation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// "1.2" or "1.3". Clamped upward by the configured global minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_protocol_version: Option<String>,

    /// Terminate nothing: pass the TLS stream through to the tcpproxy
    /// target. Mutually exclusive with secretName.
    #[serde(default)]
    pub passthrough: bool,

    /// Serve this vhost's routes on the fallback certificate when the
    /// client sends no matching SNI.
    #[serde(default)]
    pub enable_fallback_certificate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_validation: Option<ClientValidation>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientValidation {
    /// Secret holding the CA bundle (`ca.crt`) used to validate client
    /// certificates.
    pub ca_secret: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProxyRoute {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MatchCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ProxyService>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_policy: Option<TimeoutPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_policy: Option<HealthCheckPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_policy: Option<LoadBalancerPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite_policy: Option<PathRewritePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers_policy: Option<HeadersPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers_policy: Option<HeadersPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_policy: Option<RateLimitPolicy>,

    /// Serve this route over plain HTTP even when the vhost has TLS,
    /// suppressing the HTTPS upgrade redirect.
    #[serde(default)]
    pub permit_insecure: bool,

    #[serde(default)]
    pub enable_websockets: bool,

    /// Disable external authorization for this route.
    #[serde(default)]
    pub auth_disabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MatchCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderMatchCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HeaderMatchCondition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,

    #[serde(default)]
    pub present: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Invert the sense of the match.
    #[serde(default)]
    pub invert: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryParameterMatchCondition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,

    #[serde(default)]
    pub present: bool,

    #[serde(default)]
    pub ignore_case: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProxyService {
    pub name: String,
    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,

    /// Copy traffic to this service instead of routing to it. At most one
    /// service per route may mirror.
    #[serde(default)]
    pub mirror: bool,

    /// "h2", "h2c" or "tls". Unset means HTTP/1.1 cleartext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Include {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MatchCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TcpProxy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ProxyService>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Include>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimeoutPolicy {
    /// A duration string, or "infinity" to disable the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RetryPolicy {
    #[serde(default)]
    pub count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealthCheckPolicy {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_threshold_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_threshold_count: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoadBalancerPolicy {
    /// "RoundRobin", "WeightedLeastRequest", "Random", "RingHash" or
    /// "Maglev".
    pub strategy: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PathRewritePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HeadersPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<HeaderValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CorsPolicy {
    pub allow_origin: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_methods: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_headers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose_headers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,

    #[serde(default)]
    pub allow_credentials: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RateLimitPolicy {
    pub requests: u32,

    /// "second", "minute" or "hour".
    pub unit: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HTTPProxyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}

/// Grants HTTPProxy roots in other namespaces permission to reference TLS
/// secrets in this one.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1",
    kind = "TLSCertificateDelegation",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TLSCertificateDelegationSpec {
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CertificateDelegation {
    /// Name of a secret in the delegation's own namespace.
    pub secret_name: String,

    /// Namespaces allowed to reference the secret. `["*"]` allows all.
    pub target_namespaces: Vec<String>,
}

impl HTTPProxy {
    /// A root proxy owns a virtualhost; everything else is include-only.
    pub(crate) fn is_root(&self) -> bool {
        self.spec.virtualhost.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_root_proxy() {
        let proxy: HTTPProxy = serde_json::from_value(serde_json::json!({
            "apiVersion": "gantry.dev/v1",
            "kind": "HTTPProxy",
            "metadata": {"namespace": "default", "name": "echo"},
            "spec": {
                "virtualhost": {
                    "fqdn": "echo.example.com",
                    "tls": {"secretName": "echo-cert", "minimumProtocolVersion": "1.3"},
                },
                "routes": [{
                    "conditions": [{"prefix": "/"}],
                    "services": [{"name": "echo", "port": 8080}],
                }],
            },
        }))
        .unwrap();

        assert!(proxy.is_root());
        let vhost = proxy.spec.virtualhost.unwrap();
        assert_eq!(vhost.fqdn, "echo.example.com");
        assert_eq!(
            vhost.tls.unwrap().minimum_protocol_version.as_deref(),
            Some("1.3")
        );
    }

    #[test]
    fn test_parse_include_only_proxy() {
        let proxy: HTTPProxy = serde_json::from_value(serde_json::json!({
            "apiVersion": "gantry.dev/v1",
            "kind": "HTTPProxy",
            "metadata": {"namespace": "default", "name": "leaf"},
            "spec": {
                "routes": [{
                    "services": [{"name": "leaf", "port": 80, "mirror": true}],
                }],
            },
        }))
        .unwrap();

        assert!(!proxy.is_root());
        assert!(proxy.spec.routes[0].services[0].mirror);
    }

    #[test]
    fn test_parse_delegation() {
        let delegation: TLSCertificateDelegation = serde_json::from_value(serde_json::json!({
            "apiVersion": "gantry.dev/v1",
            "kind": "TLSCertificateDelegation",
            "metadata": {"namespace": "certs", "name": "wildcard"},
            "spec": {
                "delegations": [{
                    "secretName": "wildcard-cert",
                    "targetNamespaces": ["*"],
                }],
            },
        }))
        .unwrap();

        assert_eq!(delegation.spec.delegations[0].secret_name, "wildcard-cert");
    }
}
