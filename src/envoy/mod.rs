//! DAG to envoy resource translation.
//!
//! Each submodule builds one of the four served collections. Everything
//! here is deterministic: resources come out sorted by name, so two
//! builds over the same DAG produce byte-identical collections. That is
//! the contract that lets any replica serve identical xDS.

pub(crate) mod clusters;
pub(crate) mod endpoints;
pub(crate) mod listeners;
pub(crate) mod routes;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Endpoints;
use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::google::protobuf;

use crate::cache::ObjectKey;
use crate::dag::Dag;

/// Shorthand for `protobuf::Any::from_msg(val).expect("...")` with a
/// standard message.
macro_rules! into_any {
    ($msg:expr) => {
        xds_api::pb::google::protobuf::Any::from_msg(&$msg)
            .expect("failed to serialize protobuf::Any. this is a bug")
    };
}
pub(crate) use into_any;

/// Options for listener synthesis that come from operator config rather
/// than the DAG.
#[derive(Clone, Debug)]
pub(crate) struct ListenerOptions {
    pub access_log_path: String,
    /// Emit access logs as JSON lines instead of the default envoy
    /// format.
    pub access_log_json: bool,
    pub use_proxy_protocol: bool,
    /// Default bound on the lifetime of a downstream request, applied at
    /// the connection manager. Routes may still set their own timeouts.
    pub request_timeout: Option<std::time::Duration>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            access_log_path: "/dev/stdout".to_string(),
            access_log_json: false,
            use_proxy_protocol: false,
            request_timeout: None,
        }
    }
}

/// One build's worth of xDS resources, each collection sorted by name.
#[derive(Debug, Default)]
pub(crate) struct ResourceUpdate {
    pub clusters: Vec<(String, protobuf::Any)>,
    pub endpoints: Vec<(String, protobuf::Any)>,
    pub listeners: Vec<(String, protobuf::Any)>,
    pub routes: Vec<(String, protobuf::Any)>,
}

/// Translate a DAG (plus the Endpoints objects backing its clusters)
/// into the four resource collections.
pub(crate) fn translate(
    dag: &Dag,
    endpoints: &BTreeMap<ObjectKey, Arc<Endpoints>>,
    options: &ListenerOptions,
) -> ResourceUpdate {
    let mut update = ResourceUpdate {
        clusters: clusters::build(dag),
        endpoints: endpoints::build(dag, endpoints),
        listeners: listeners::build(dag, options),
        routes: routes::build(dag),
    };

    update.clusters.sort_by(|a, b| a.0.cmp(&b.0));
    update.endpoints.sort_by(|a, b| a.0.cmp(&b.0));
    update.listeners.sort_by(|a, b| a.0.cmp(&b.0));
    update.routes.sort_by(|a, b| a.0.cmp(&b.0));
    update
}

/// The config source that tells envoy to fetch a resource over ADS.
pub(crate) fn ads_config_source() -> xds_core::ConfigSource {
    xds_core::ConfigSource {
        config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Ads(
            xds_core::AggregatedConfigSource::default(),
        )),
        resource_api_version: xds_core::ApiVersion::V3 as i32,
        ..Default::default()
    }
}

/// The EDS resource name a cluster's load assignment is published
/// under. Unlike the cluster name this is never hashed: clusters with
/// different policies against the same service port share one
/// assignment.
pub(crate) fn load_assignment_name(cluster: &crate::dag::Cluster) -> String {
    let port = cluster
        .port_name
        .clone()
        .unwrap_or_else(|| cluster.port.to_string());
    format!("{}/{}/{}", cluster.service.namespace, cluster.service.name, port)
}
