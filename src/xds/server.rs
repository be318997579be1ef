//! The xDS gRPC server.
//!
//! One long-lived task per ADS stream: requests come from the peer,
//! wakeups come from the resource caches, and both funnel through the
//! per-connection protocol state. Per-type streaming endpoints point
//! callers at ADS; the unary Fetch endpoints answer with the current
//! snapshot.

use std::{
    net::SocketAddr,
    pin::Pin,
    time::{Duration, Instant},
};

use enum_map::EnumMap;
use futures::Stream;
use metrics::counter;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, trace, warn, Span};
use xds_api::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::ClusterDiscoveryService,
    discovery::v3::{
        aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
        DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::EndpointDiscoveryService,
    listener::v3::listener_discovery_service_server::ListenerDiscoveryService,
    route::v3::route_discovery_service_server::RouteDiscoveryService,
};

use crate::{
    grpc_access,
    xds::{AdsConnection, ResourceType, SnapshotCache},
};

#[derive(Clone)]
pub(crate) struct AdsServer {
    cache: SnapshotCache,
}

impl AdsServer {
    pub(crate) fn new(cache: SnapshotCache) -> Self {
        Self { cache }
    }

    fn fetch(
        &self,
        resource_type: ResourceType,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let request = request.into_inner();

        grpc_access::xds_discovery_request(&request);

        let snapshot_version = self.cache.version(resource_type);
        if snapshot_version == 0 {
            return Err(Status::unavailable("no snapshot available"));
        }

        let request_version: Option<u64> = request.version_info.parse().ok();
        if request_version == Some(snapshot_version) {
            return Err(Status::cancelled("already up to date"));
        }

        let values = self.cache.values(resource_type);
        let resources = if request.resource_names.is_empty() {
            values.values().cloned().collect()
        } else {
            request
                .resource_names
                .iter()
                .filter_map(|name| values.get(name).cloned())
                .collect()
        };

        let response = DiscoveryResponse {
            version_info: snapshot_version.to_string(),
            type_url: resource_type.type_url().to_string(),
            resources,
            ..Default::default()
        };
        grpc_access::xds_discovery_response(&response);

        Ok(Response::new(response))
    }
}

macro_rules! try_send {
    ($ch:expr, $value:expr) => {
        if $ch.send($value).await.is_err() {
            tracing::debug!("channel closed unexpectedly");
            return;
        }
    };
}

#[tracing::instrument(
    level = "info",
    skip_all,
    fields(
        remote_addr = tracing::field::Empty,
        node_id = tracing::field::Empty,
        node_cluster = tracing::field::Empty,
    )
)]
async fn stream_ads(
    snapshot: SnapshotCache,
    remote_addr: Option<SocketAddr>,
    mut requests: Streaming<DiscoveryRequest>,
    send_response: tokio::sync::mpsc::Sender<Result<DiscoveryResponse, Status>>,
) {
    let _conn_active = crate::metrics::scoped_gauge!("ads.active_connections", 1);

    // ?remote_addr shows us Some(_) when an addr is present and
    // %remote_addr doesn't compile. this is annoying but do it anyway.
    if let Some(addr) = remote_addr {
        Span::current().record("remote_addr", addr.to_string());
    }

    macro_rules! send_xds {
        ($chan:expr, $message:expr) => {
            grpc_access::xds_discovery_response(&$message);
            try_send!($chan, Ok($message));
            counter!("ads.tx").increment(1);
        };
    }

    macro_rules! recv_xds {
        ($message:expr) => {
            match $message {
                Ok(Some(msg)) => {
                    grpc_access::xds_discovery_request(&msg);
                    counter!("ads.rx").increment(1);
                    msg
                },
                // the stream has ended
                Ok(None) => return,
                // the connection is hosed, just bail
                Err(e) if io_source(&e).is_some() => {
                    trace!(err = %e, "closing connection: ignoring io error");
                    return;
                },
                // something actually went wrong!
                Err(e) => {
                    warn!(err = %e, "an unexpected error occurred, closing the connection");
                    return;
                },
            }
        }
    }

    let mut changes = snapshot.changes();

    // pull the Node out of the initial request and record it on the span
    // so we can forget about it for the rest of the stream.
    let mut initial_request = recv_xds!(requests.message().await);
    let mut conn = match AdsConnection::from_initial_request(&mut initial_request, snapshot) {
        Ok(conn) => conn,
        Err(e) => {
            info!(err = %e, "refusing connection: invalid initial request");
            try_send!(send_response, Err(e.into_status()));
            return;
        }
    };

    let node = conn.node();
    let current_span = Span::current();
    current_span.record("node_id", &node.id);
    current_span.record("node_cluster", &node.cluster);

    // first round of message handling. this is *almost* identical to any
    // subsequent round, except there can't be cache wakeups yet.
    let mut timer = CacheTimer::new(Duration::from_millis(500));
    let (rtype, response) = match conn.handle_ads_request(initial_request) {
        Ok(result) => result,
        Err(e) => {
            info!(node = ?conn.node(), err = %e, "closing connection: invalid request");
            try_send!(send_response, Err(e.into_status()));
            return;
        }
    };
    if let Some(rtype) = rtype {
        timer.touch(rtype, Instant::now());
    }
    if let Some(response) = response {
        send_xds!(send_response, response);
    }

    // respond to either an incoming request or a debounced cache update
    // until the client goes away.
    loop {
        let response = tokio::select! {
            rtype = timer.wait() => conn.handle_snapshot_update(rtype),
            changed = changes.changed() => {
                timer.touch(changed, Instant::now());
                continue;
            },
            request = requests.message() => {
                let message = recv_xds!(request);

                match conn.handle_ads_request(message) {
                    Ok((_, response)) => response,
                    Err(e) => {
                        info!(node = ?conn.node(), err = %e, "closing connection: invalid request");
                        try_send!(send_response, Err(e.into_status()));
                        return;
                    },
                }
            },
        };

        if let Some(response) = response {
            send_xds!(send_response, response);
        }
    }
}

fn io_source(status: &Status) -> Option<&std::io::Error> {
    let mut err: &(dyn std::error::Error + 'static) = status;

    loop {
        if let Some(e) = err.downcast_ref::<std::io::Error>() {
            return Some(e);
        }

        if let Some(e) = err.downcast_ref::<h2::Error>().and_then(|e| e.get_io()) {
            return Some(e);
        }

        err = err.source()?;
    }
}

/// A debouncing timer for cache updates: it fires `interval` after the
/// first touch and ignores further touches until it fires.
///
/// The timer is keyed by [ResourceType]. It could be generic, but
/// there's no reason to do that.
struct CacheTimer {
    interval: Duration,
    timers: EnumMap<ResourceType, Option<Instant>>,
}

impl CacheTimer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            timers: Default::default(),
        }
    }

    fn touch(&mut self, resource_type: ResourceType, now: Instant) {
        self.timers[resource_type].get_or_insert(now + self.interval);
    }

    fn next_deadline(&mut self) -> Option<(ResourceType, Instant)> {
        let min_entry = self
            .timers
            .iter()
            .filter_map(|(rtype, deadline)| Option::zip(Some(rtype), *deadline))
            .min_by_key(|(_rtype, deadline)| *deadline);

        if let Some((rtype, _)) = min_entry.as_ref() {
            self.timers[*rtype] = None;
        }

        min_entry
    }

    async fn wait(&mut self) -> ResourceType {
        match self.next_deadline() {
            Some((rtype, deadline)) => {
                tokio::time::sleep_until(deadline.into()).await;
                rtype
            }
            None => futures::future::pending().await,
        }
    }
}

type SotwResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaResponseStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream = SotwResponseStream;
    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let remote_addr = request.remote_addr();

        let requests = request.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(1);

        tokio::spawn(stream_ads(self.cache.clone(), remote_addr, requests, tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented(
            "gantry does not support incremental xDS",
        ))
    }
}

macro_rules! impl_fetch_api {
    (impl $trait:ty => $resource_type:ident { type $sotw_stream:ident; type $delta_stream:ident; fn $fetch:ident; fn $stream:ident; fn $delta:ident;}) => {
        #[tonic::async_trait]
        impl $trait for AdsServer {
            type $sotw_stream = SotwResponseStream;
            type $delta_stream = DeltaResponseStream;

            async fn $fetch(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                self.fetch(ResourceType::$resource_type, request)
            }

            async fn $stream(
                &self,
                _request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$sotw_stream>, Status> {
                Err(Status::unimplemented(
                    "gantry does not support per-type streams. please use ADS",
                ))
            }

            async fn $delta(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_stream>, Status> {
                Err(Status::unimplemented(
                    "gantry does not support incremental xDS",
                ))
            }
        }
    };
}

impl_fetch_api! {
    impl ListenerDiscoveryService => Listener {
        type StreamListenersStream;
        type DeltaListenersStream;

        fn fetch_listeners;
        fn stream_listeners;
        fn delta_listeners;
    }
}

impl_fetch_api! {
    impl RouteDiscoveryService => RouteConfiguration {
        type StreamRoutesStream;
        type DeltaRoutesStream;

        fn fetch_routes;
        fn stream_routes;
        fn delta_routes;
    }
}

impl_fetch_api! {
    impl ClusterDiscoveryService => Cluster {
        type StreamClustersStream;
        type DeltaClustersStream;

        fn fetch_clusters;
        fn stream_clusters;
        fn delta_clusters;
    }
}

impl_fetch_api! {
    impl EndpointDiscoveryService => ClusterLoadAssignment {
        type StreamEndpointsStream;
        type DeltaEndpointsStream;

        fn fetch_endpoints;
        fn stream_endpoints;
        fn delta_endpoints;
    }
}

#[cfg(test)]
mod test_timer {
    use std::time::{Duration, Instant};

    use crate::xds::ResourceType;

    use super::CacheTimer;

    #[test]
    fn test_touch_one() {
        let now = Instant::now();
        let mut t = CacheTimer::new(Duration::from_secs(1));

        // touching once sets the deadline.
        t.touch(ResourceType::Cluster, now);
        assert_eq!(
            t.next_deadline(),
            Some((ResourceType::Cluster, now + t.interval))
        );
        assert_eq!(t.next_deadline(), None);

        // touching twice has no effect
        t.touch(ResourceType::Cluster, now);
        t.touch(ResourceType::Cluster, now);
        assert_eq!(
            t.next_deadline(),
            Some((ResourceType::Cluster, now + t.interval))
        );
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn test_touch_many() {
        let now = Instant::now();
        let delta = Duration::from_millis(250);
        let mut t = CacheTimer::new(Duration::from_secs(1));

        // touch two in sequence
        t.touch(ResourceType::Cluster, now);
        t.touch(ResourceType::ClusterLoadAssignment, now + delta);
        assert_eq!(
            t.next_deadline(),
            Some((ResourceType::Cluster, now + t.interval))
        );
        assert_eq!(
            t.next_deadline(),
            Some((
                ResourceType::ClusterLoadAssignment,
                now + delta + t.interval
            ))
        );
        assert_eq!(t.next_deadline(), None);

        // touch two, multiple touches don't reset things
        t.touch(ResourceType::Cluster, now);
        t.touch(ResourceType::Cluster, now + delta);
        t.touch(ResourceType::ClusterLoadAssignment, now + delta);
        assert_eq!(
            t.next_deadline(),
            Some((ResourceType::Cluster, now + t.interval))
        );
        assert_eq!(
            t.next_deadline(),
            Some((
                ResourceType::ClusterLoadAssignment,
                now + delta + t.interval
            ))
        );
        assert_eq!(t.next_deadline(), None);
    }
}
