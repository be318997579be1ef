//! Per-stream State-of-the-World protocol state.
//!
//! One [`AdsConnection`] tracks, for each resource type, what was last
//! sent, what the client last acknowledged and which resource names it
//! subscribed to. The connection itself is synchronous; the surrounding
//! stream task feeds it requests and cache-change wakeups and sends
//! whatever it returns.

use std::collections::BTreeSet;

use enum_map::EnumMap;
use xds_api::pb::envoy::{
    config::core::v3 as xds_node,
    service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
};

use crate::xds::cache::{ResourceMap, SnapshotCache};
use crate::xds::resources::ResourceType;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectionError {
    #[error("missing node info")]
    MissingNode,

    #[error("invalid version_info: {0:?}")]
    InvalidVersion(String),
}

impl ConnectionError {
    pub(crate) fn into_status(self) -> tonic::Status {
        tonic::Status::invalid_argument(self.to_string())
    }
}

pub(crate) struct AdsConnection {
    node: xds_node::Node,
    nonce: u64,
    snapshot: SnapshotCache,
    subscriptions: EnumMap<ResourceType, Option<AdsSubscription>>,
}

#[derive(Debug, Default)]
struct AdsSubscription {
    resource_names: ResourceNames,

    last_sent_version: Option<u64>,
    last_sent_nonce: Option<String>,

    /// Whether the client applied the last response. A NACK flips this
    /// false but deliberately leaves `last_sent_version` alone: what we
    /// sent stays authoritative, and we don't re-send a config the
    /// client just refused.
    applied: bool,
    last_ack_version: Option<u64>,
}

impl AdsConnection {
    pub(crate) fn from_initial_request(
        request: &mut DiscoveryRequest,
        snapshot: SnapshotCache,
    ) -> Result<Self, ConnectionError> {
        let node = request.node.take().ok_or(ConnectionError::MissingNode)?;

        Ok(Self {
            node,
            nonce: 0,
            snapshot,
            subscriptions: EnumMap::default(),
        })
    }

    pub(crate) fn node(&self) -> &xds_node::Node {
        &self.node
    }

    /// Handle one request: account for ACK/NACK, update subscriptions,
    /// and produce a response when the client is out of date.
    pub(crate) fn handle_ads_request(
        &mut self,
        request: DiscoveryRequest,
    ) -> Result<(Option<ResourceType>, Option<DiscoveryResponse>), ConnectionError> {
        let Some(rtype) = ResourceType::from_type_url(&request.type_url) else {
            return Ok((None, None));
        };

        let request_version = parse_nonempty(&request.version_info)
            .map_err(|_| ConnectionError::InvalidVersion(request.version_info.clone()))?;
        let is_nack = request.error_detail.is_some();

        let sub = self.subscriptions[rtype].get_or_insert_with(AdsSubscription::default);

        // only a request echoing our last nonce moves the ACK state;
        // anything else is a stale in-flight request or a subscription
        // change.
        if !request.response_nonce.is_empty()
            && sub.last_sent_nonce.as_deref() == Some(request.response_nonce.as_str())
        {
            if is_nack {
                sub.applied = false;
            } else {
                sub.applied = true;
                sub.last_ack_version = request_version;
            }
        }

        let resource_names =
            ResourceNames::from_names(&sub.resource_names, request.resource_names);
        let names_changed = sub.resource_names != resource_names;
        if names_changed {
            sub.resource_names = resource_names;
        }

        // resend when this stream hasn't seen the current cache version.
        // comparing against last-sent (not last-acked) keeps a NACKed
        // version authoritative instead of replaying it forever.
        let cache_version = self.snapshot.version(rtype);
        let out_of_date = sub.last_sent_version != Some(cache_version)
            && request_version != Some(cache_version);

        let response = if out_of_date || names_changed {
            self.sotw_response(rtype)
        } else {
            None
        };

        Ok((Some(rtype), response))
    }

    /// Handle a cache-change wakeup for one type.
    pub(crate) fn handle_snapshot_update(
        &mut self,
        changed_type: ResourceType,
    ) -> Option<DiscoveryResponse> {
        // no response for types the client never asked about.
        self.subscriptions[changed_type].as_ref()?;

        let cache_version = self.snapshot.version(changed_type);
        let sub = self.subscriptions[changed_type]
            .as_ref()
            .expect("checked above");
        if sub.last_sent_version == Some(cache_version) {
            return None;
        }

        self.sotw_response(changed_type)
    }

    /// Build the full State-of-the-World response for one type.
    fn sotw_response(&mut self, rtype: ResourceType) -> Option<DiscoveryResponse> {
        let version = self.snapshot.version(rtype);
        if version == 0 {
            // nothing has ever been written; stay quiet rather than
            // un-warm the client with an empty set.
            return None;
        }

        let values = self.snapshot.values(rtype);
        let sub = self.subscriptions[rtype].as_mut().expect("caller created the subscription");

        let resources = filter(&values, &sub.resource_names);

        // empty responses are only safe before the client has applied
        // anything: after that they'd wipe a warm config.
        if resources.is_empty() && sub.last_ack_version.is_some() {
            return None;
        }

        self.nonce = self.nonce.wrapping_add(1);
        let nonce = self.nonce.to_string();
        let sub = self.subscriptions[rtype].as_mut().expect("checked above");
        sub.last_sent_nonce = Some(nonce.clone());
        sub.last_sent_version = Some(version);

        Some(DiscoveryResponse {
            type_url: rtype.type_url().to_string(),
            version_info: version.to_string(),
            nonce,
            resources,
            ..Default::default()
        })
    }
}

fn filter(
    values: &ResourceMap,
    names: &ResourceNames,
) -> Vec<xds_api::pb::google::protobuf::Any> {
    match names {
        ResourceNames::EmptyWildcard | ResourceNames::Wildcard(_) => {
            values.values().cloned().collect()
        }
        ResourceNames::Explicit(names) => names
            .iter()
            .filter_map(|name| values.get(name).cloned())
            .collect(),
    }
}

fn parse_nonempty(s: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse().map(Some)
}

/// A set of xDS resource names.
///
/// LDS and CDS wildcard handling requires distinguishing "never sent any
/// names" from an explicit `*` subscription.
///
/// https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol#how-the-client-specifies-what-resources-to-return
#[derive(Clone, Debug, PartialEq, Eq)]
enum ResourceNames {
    EmptyWildcard,
    Wildcard(BTreeSet<String>),
    Explicit(BTreeSet<String>),
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::EmptyWildcard
    }
}

impl FromIterator<String> for ResourceNames {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut inner = BTreeSet::new();
        let mut wildcard = false;

        for name in iter {
            if name == "*" {
                wildcard = true;
            } else {
                inner.insert(name);
            }
        }

        if wildcard {
            Self::Wildcard(inner)
        } else {
            Self::Explicit(inner)
        }
    }
}

impl ResourceNames {
    fn from_names(previous: &Self, names: Vec<String>) -> Self {
        if names.is_empty() && matches!(previous, Self::EmptyWildcard) {
            Self::EmptyWildcard
        } else {
            Self::from_iter(names)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::envoy::ResourceUpdate;
    use crate::xds::cache::{new_snapshot, SnapshotWriter};
    use xds_api::pb::google::protobuf;

    fn anything(value: &[u8]) -> protobuf::Any {
        protobuf::Any {
            type_url: "test".to_string(),
            value: value.to_vec(),
        }
    }

    fn seed(
        writer: &mut SnapshotWriter,
        data: Vec<(ResourceType, Vec<&'static str>)>,
    ) -> u64 {
        let mut update = ResourceUpdate::default();
        for (rtype, names) in data {
            let entries: Vec<(String, protobuf::Any)> = names
                .into_iter()
                .map(|n| (n.to_string(), anything(n.as_bytes())))
                .collect();
            match rtype {
                ResourceType::Cluster => update.clusters = entries,
                ResourceType::ClusterLoadAssignment => update.endpoints = entries,
                ResourceType::Listener => update.listeners = entries,
                ResourceType::RouteConfiguration => update.routes = entries,
            }
        }
        writer.update(update)
    }

    fn discovery_request(
        rtype: ResourceType,
        version_info: &str,
        response_nonce: &str,
        names: Vec<&str>,
    ) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: rtype.type_url().to_string(),
            resource_names: names.into_iter().map(|n| n.to_string()).collect(),
            version_info: version_info.to_string(),
            response_nonce: response_nonce.to_string(),
            ..Default::default()
        }
    }

    fn initial_request(rtype: ResourceType, names: Vec<&str>) -> DiscoveryRequest {
        DiscoveryRequest {
            node: Some(xds_node::Node {
                id: "test-node".to_string(),
                ..Default::default()
            }),
            ..discovery_request(rtype, "", "", names)
        }
    }

    fn nack(rtype: ResourceType, version_info: &str, response_nonce: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            error_detail: Some(xds_api::pb::google::rpc::Status {
                code: tonic::Code::InvalidArgument.into(),
                message: "no thanks".to_string(),
                ..Default::default()
            }),
            ..discovery_request(rtype, version_info, response_nonce, vec![])
        }
    }

    fn connection(snapshot: crate::xds::cache::SnapshotCache) -> AdsConnection {
        let mut request = initial_request(ResourceType::Cluster, vec![]);
        AdsConnection::from_initial_request(&mut request, snapshot).unwrap()
    }

    #[test]
    fn test_missing_node_refused() {
        let (snapshot, _writer) = new_snapshot();
        let mut request = discovery_request(ResourceType::Cluster, "", "", vec![]);
        let err = AdsConnection::from_initial_request(&mut request, snapshot).unwrap_err();
        assert!(matches!(err, ConnectionError::MissingNode));
    }

    #[test]
    fn test_cold_cache_sends_nothing() {
        let (snapshot, _writer) = new_snapshot();
        let mut conn = connection(snapshot);

        let (rtype, response) = conn
            .handle_ads_request(discovery_request(ResourceType::Cluster, "", "", vec![]))
            .unwrap();
        assert_eq!(rtype, Some(ResourceType::Cluster));
        assert!(response.is_none(), "no snapshot yet, nothing to send");
    }

    #[test]
    fn test_wildcard_gets_everything() {
        let (snapshot, mut writer) = new_snapshot();
        seed(&mut writer, vec![(ResourceType::Cluster, vec!["a", "b"])]);
        let mut conn = connection(snapshot);

        let (_, response) = conn
            .handle_ads_request(discovery_request(ResourceType::Cluster, "", "", vec![]))
            .unwrap();
        let response = response.unwrap();
        assert_eq!(response.resources.len(), 2);
        assert!(!response.nonce.is_empty());
    }

    #[test]
    fn test_explicit_names_filtered() {
        let (snapshot, mut writer) = new_snapshot();
        seed(
            &mut writer,
            vec![(ResourceType::ClusterLoadAssignment, vec!["a", "b", "c"])],
        );
        let mut conn = connection(snapshot);

        let (_, response) = conn
            .handle_ads_request(discovery_request(
                ResourceType::ClusterLoadAssignment,
                "",
                "",
                vec!["a", "c", "missing"],
            ))
            .unwrap();
        assert_eq!(response.unwrap().resources.len(), 2);
    }

    #[test]
    fn test_ack_then_idle() {
        let (snapshot, mut writer) = new_snapshot();
        seed(&mut writer, vec![(ResourceType::Cluster, vec!["a"])]);
        let mut conn = connection(snapshot);

        let (_, response) = conn
            .handle_ads_request(discovery_request(ResourceType::Cluster, "", "", vec![]))
            .unwrap();
        let response = response.unwrap();

        // ACK: same version, echoed nonce. nothing more to send.
        let (_, next) = conn
            .handle_ads_request(discovery_request(
                ResourceType::Cluster,
                &response.version_info,
                &response.nonce,
                vec![],
            ))
            .unwrap();
        assert!(next.is_none());

        // and a cache wakeup for the same version is also a no-op.
        assert!(conn.handle_snapshot_update(ResourceType::Cluster).is_none());
    }

    #[test]
    fn test_nack_keeps_last_sent_authoritative() {
        let (snapshot, mut writer) = new_snapshot();
        seed(&mut writer, vec![(ResourceType::Cluster, vec!["a"])]);
        let mut conn = connection(snapshot);

        let (_, response) = conn
            .handle_ads_request(discovery_request(ResourceType::Cluster, "", "", vec![]))
            .unwrap();
        let response = response.unwrap();

        // NACK: the client rejected the config. we must not re-send the
        // same version in a loop.
        let (_, next) = conn
            .handle_ads_request(nack(ResourceType::Cluster, "", &response.nonce))
            .unwrap();
        assert!(next.is_none());
        assert!(conn.handle_snapshot_update(ResourceType::Cluster).is_none());

        // a new version goes out as usual.
        seed(&mut writer, vec![(ResourceType::Cluster, vec!["a", "b"])]);
        let next = conn.handle_snapshot_update(ResourceType::Cluster).unwrap();
        assert_eq!(next.resources.len(), 2);
    }

    #[test]
    fn test_versions_strictly_increase_and_nonces_unique() {
        let (snapshot, mut writer) = new_snapshot();
        seed(&mut writer, vec![(ResourceType::Cluster, vec!["a"])]);
        let mut conn = connection(snapshot);

        let (_, first) = conn
            .handle_ads_request(discovery_request(ResourceType::Cluster, "", "", vec![]))
            .unwrap();
        let first = first.unwrap();

        seed(&mut writer, vec![(ResourceType::Cluster, vec!["a", "b"])]);
        let second = conn.handle_snapshot_update(ResourceType::Cluster).unwrap();

        let v1: u64 = first.version_info.parse().unwrap();
        let v2: u64 = second.version_info.parse().unwrap();
        assert!(v2 > v1);
        assert_ne!(first.nonce, second.nonce);
    }

    #[test]
    fn test_subscription_change_triggers_resend() {
        let (snapshot, mut writer) = new_snapshot();
        seed(
            &mut writer,
            vec![(ResourceType::ClusterLoadAssignment, vec!["a", "b"])],
        );
        let mut conn = connection(snapshot);

        let (_, response) = conn
            .handle_ads_request(discovery_request(
                ResourceType::ClusterLoadAssignment,
                "",
                "",
                vec!["a"],
            ))
            .unwrap();
        let response = response.unwrap();
        assert_eq!(response.resources.len(), 1);

        // ACK that also grows the subscription: new data must flow even
        // though the version is current.
        let (_, next) = conn
            .handle_ads_request(discovery_request(
                ResourceType::ClusterLoadAssignment,
                &response.version_info,
                &response.nonce,
                vec!["a", "b"],
            ))
            .unwrap();
        assert_eq!(next.unwrap().resources.len(), 2);
    }

    #[test]
    fn test_empty_update_suppressed_after_warm() {
        let (snapshot, mut writer) = new_snapshot();
        seed(
            &mut writer,
            vec![(ResourceType::ClusterLoadAssignment, vec!["a"])],
        );
        let mut conn = connection(snapshot);

        let (_, response) = conn
            .handle_ads_request(discovery_request(
                ResourceType::ClusterLoadAssignment,
                "",
                "",
                vec!["a"],
            ))
            .unwrap();
        let response = response.unwrap();

        // ACK to warm the subscription.
        let (_, _) = conn
            .handle_ads_request(discovery_request(
                ResourceType::ClusterLoadAssignment,
                &response.version_info,
                &response.nonce,
                vec!["a"],
            ))
            .unwrap();

        // "a" disappears. a warm client must not receive an empty set
        // that would blackhole its traffic.
        seed(
            &mut writer,
            vec![(ResourceType::ClusterLoadAssignment, vec!["other"])],
        );
        assert!(conn
            .handle_snapshot_update(ResourceType::ClusterLoadAssignment)
            .is_none());
    }

    #[test]
    fn test_first_send_may_be_empty() {
        let (snapshot, mut writer) = new_snapshot();
        seed(
            &mut writer,
            vec![(ResourceType::ClusterLoadAssignment, vec!["other"])],
        );
        let mut conn = connection(snapshot);

        // never ACKed anything: an empty response is allowed (cold
        // start).
        let (_, response) = conn
            .handle_ads_request(discovery_request(
                ResourceType::ClusterLoadAssignment,
                "",
                "",
                vec!["missing"],
            ))
            .unwrap();
        let response = response.unwrap();
        assert!(response.resources.is_empty());
    }

    #[test]
    fn test_unknown_type_url_ignored() {
        let (snapshot, _writer) = new_snapshot();
        let mut conn = connection(snapshot);

        let request = DiscoveryRequest {
            type_url: "type.googleapis.com/envoy.unknown.v3.Widget".to_string(),
            ..Default::default()
        };
        let (rtype, response) = conn.handle_ads_request(request).unwrap();
        assert!(rtype.is_none());
        assert!(response.is_none());
    }

    #[test]
    fn test_garbage_version_is_an_error() {
        let (snapshot, _writer) = new_snapshot();
        let mut conn = connection(snapshot);

        let err = conn
            .handle_ads_request(discovery_request(
                ResourceType::Cluster,
                "not-a-number",
                "",
                vec![],
            ))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidVersion(_)));
    }
}
