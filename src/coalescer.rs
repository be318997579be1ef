//! The event coalescer: turns a firehose of object-change signals into
//! paced rebuilds.
//!
//! Every change restarts a short holdoff timer; the first change of a
//! burst also arms a maximum-delay timer. A rebuild fires when either
//! expires, so a steady drizzle of events still converges and a busy
//! burst can't starve the proxies of updates. Rebuilds are serialized by
//! construction: this task is the only caller.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{Kind, KubernetesCache};
use crate::dag::{Builder, StatusMap};
use crate::envoy::{self, ListenerOptions};
use crate::status::StatusUpdate;
use crate::xds::SnapshotWriter;

pub(crate) const HOLDOFF: Duration = Duration::from_millis(100);
pub(crate) const MAX_DELAY: Duration = Duration::from_millis(500);

/// The timer state machine, split from the task so it can be tested
/// with plain Instant arithmetic.
#[derive(Debug)]
pub(crate) struct Coalescer {
    holdoff: Duration,
    max_delay: Duration,
    holdoff_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
}

impl Coalescer {
    pub(crate) fn new(holdoff: Duration, max_delay: Duration) -> Self {
        Self {
            holdoff,
            max_delay,
            holdoff_deadline: None,
            max_deadline: None,
        }
    }

    /// Note an event at `now`. The holdoff restarts; the max-delay
    /// timer only arms if it wasn't already running.
    pub(crate) fn event(&mut self, now: Instant) {
        self.holdoff_deadline = Some(now + self.holdoff);
        self.max_deadline.get_or_insert(now + self.max_delay);
    }

    /// When the next rebuild should fire, if one is pending.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match (self.holdoff_deadline, self.max_deadline) {
            (Some(h), Some(m)) => Some(h.min(m)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    /// Clear pending state; called when a rebuild fires.
    pub(crate) fn fire(&mut self) {
        self.holdoff_deadline = None;
        self.max_deadline = None;
    }

    pub(crate) fn pending(&self) -> bool {
        self.deadline().is_some()
    }
}

/// The long-lived rebuild task.
pub(crate) struct EventHandler {
    events: mpsc::Receiver<Kind>,
    cache: Arc<RwLock<KubernetesCache>>,
    builder: Builder,
    listener_options: ListenerOptions,
    writer: SnapshotWriter,
    status_tx: mpsc::Sender<Vec<StatusUpdate>>,
    is_leader: watch::Receiver<bool>,
}

impl EventHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        events: mpsc::Receiver<Kind>,
        cache: Arc<RwLock<KubernetesCache>>,
        builder: Builder,
        listener_options: ListenerOptions,
        writer: SnapshotWriter,
        status_tx: mpsc::Sender<Vec<StatusUpdate>>,
        is_leader: watch::Receiver<bool>,
    ) -> Self {
        Self {
            events,
            cache,
            builder,
            listener_options,
            writer,
            status_tx,
            is_leader,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut coalescer = Coalescer::new(HOLDOFF, MAX_DELAY);

        loop {
            tokio::select! {
                biased;

                _ = sleep_until(coalescer.deadline()) => {
                    coalescer.fire();
                    self.rebuild().await;
                }

                changed = self.is_leader.changed() => {
                    if changed.is_err() {
                        debug!("leadership channel closed, rebuild task exiting");
                        return;
                    }
                    // a fresh leader rebuilds immediately so statuses are
                    // written without waiting out a holdoff.
                    if *self.is_leader.borrow() {
                        info!("became leader");
                        coalescer.fire();
                        self.rebuild().await;
                    }
                }

                event = self.events.recv() => {
                    let Some(kind) = event else {
                        // drain finished. run a final rebuild if one was
                        // pending, then stop.
                        if coalescer.pending() {
                            self.rebuild().await;
                        }
                        debug!("event channel closed, rebuild task exiting");
                        return;
                    };
                    debug!(kind = ?kind, "object changed");
                    coalescer.event(Instant::now());
                }
            }
        }
    }

    async fn rebuild(&mut self) {
        let _timer = crate::metrics::scoped_timer!("rebuild_time");

        let snapshot = {
            let cache = self.cache.read().expect("kubernetes cache lock poisoned");
            cache.contents()
        };

        let (dag, statuses) = self.builder.build(&snapshot);
        let update = envoy::translate(&dag, &snapshot.endpoints, &self.listener_options);
        let version = self.writer.update(update);

        info!(
            %version,
            http_hosts = dag.http_hosts.len(),
            https_hosts = dag.https_hosts.len(),
            clusters = dag.clusters.len(),
            statuses = statuses.len(),
            "rebuilt",
        );

        // every replica serves xDS; only the leader writes statuses back
        // to the API server.
        if *self.is_leader.borrow() {
            let updates = status_updates(&statuses);
            if !updates.is_empty() && self.status_tx.send(updates).await.is_err() {
                debug!("status writer gone, dropping status updates");
            }
        }
    }
}

/// Pull the writable statuses out of a build's status map.
fn status_updates(statuses: &StatusMap) -> Vec<StatusUpdate> {
    statuses
        .iter()
        .filter(|(key, _)| key.0 == "HTTPProxy" || key.0 == "HTTPRoute")
        .map(|((kind, key), status)| StatusUpdate {
            kind: *kind,
            key: key.clone(),
            generation: status.generation,
            conditions: status.conditions(),
        })
        .collect()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_holdoff_restarts_per_event() {
        let start = Instant::now();
        let mut c = Coalescer::new(HOLDOFF, MAX_DELAY);

        c.event(start);
        assert_eq!(c.deadline(), Some(start + HOLDOFF));

        // a second event 50ms in pushes the holdoff out.
        c.event(start + Duration::from_millis(50));
        assert_eq!(
            c.deadline(),
            Some(start + Duration::from_millis(50) + HOLDOFF)
        );
    }

    #[test]
    fn test_max_delay_caps_a_continuous_burst() {
        let start = Instant::now();
        let mut c = Coalescer::new(HOLDOFF, MAX_DELAY);

        // events every 50ms keep restarting the holdoff, but the max
        // deadline set by the first event doesn't move.
        let mut now = start;
        for _ in 0..20 {
            c.event(now);
            now += Duration::from_millis(50);
        }
        assert_eq!(c.deadline(), Some(start + MAX_DELAY));
    }

    #[test]
    fn test_burst_rebuild_bound() {
        // over a burst of duration T, at most ceil(T / MAX_DELAY) + 1
        // rebuilds fire.
        let start = Instant::now();
        let burst = Duration::from_millis(2200);
        let step = Duration::from_millis(10);

        let mut c = Coalescer::new(HOLDOFF, MAX_DELAY);
        let mut fires = 0;

        let mut now = start;
        while now < start + burst {
            if let Some(deadline) = c.deadline() {
                if deadline <= now {
                    c.fire();
                    fires += 1;
                }
            }
            c.event(now);
            now += step;
        }
        // the trailing holdoff fires one more after the burst ends.
        if c.pending() {
            fires += 1;
        }

        let bound = burst.as_millis().div_ceil(MAX_DELAY.as_millis()) + 1;
        assert!(
            (fires as u128) <= bound,
            "{fires} rebuilds for a {}ms burst, bound {bound}",
            burst.as_millis()
        );
    }

    use crate::cache::KubeObject;
    use crate::dag::BuilderConfig;
    use crate::xds::ResourceType;

    fn seeded_cache() -> Arc<RwLock<KubernetesCache>> {
        let mut cache = KubernetesCache::default();
        let svc: k8s_openapi::api::core::v1::Service =
            serde_json::from_value(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"namespace": "default", "name": "echo"},
                "spec": {"ports": [{"port": 8080}]},
            }))
            .unwrap();
        let proxy: crate::apis::HTTPProxy = serde_json::from_value(serde_json::json!({
            "apiVersion": "gantry.dev/v1",
            "kind": "HTTPProxy",
            "metadata": {"namespace": "default", "name": "echo"},
            "spec": {
                "virtualhost": {"fqdn": "echo.example.com"},
                "routes": [{"services": [{"name": "echo", "port": 8080}]}],
            },
        }))
        .unwrap();
        cache.insert(KubeObject::Service(Arc::new(svc))).unwrap();
        cache.insert(KubeObject::HTTPProxy(Arc::new(proxy))).unwrap();
        Arc::new(RwLock::new(cache))
    }

    fn spawn_handler(
        cache: Arc<RwLock<KubernetesCache>>,
        leader: bool,
    ) -> (
        crate::xds::SnapshotCache,
        mpsc::Sender<Kind>,
        watch::Sender<bool>,
        mpsc::Receiver<Vec<StatusUpdate>>,
    ) {
        let (snapshot, writer) = crate::xds::new_snapshot();
        let (event_tx, event_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = mpsc::channel(16);
        let (leader_tx, leader_rx) = watch::channel(leader);

        tokio::spawn(
            EventHandler::new(
                event_rx,
                cache,
                Builder::new(BuilderConfig::default()),
                ListenerOptions::default(),
                writer,
                status_tx,
                leader_rx,
            )
            .run(),
        );

        (snapshot, event_tx, leader_tx, status_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_rebuilds_after_holdoff() {
        let (snapshot, event_tx, _leader_tx, _status_rx) = spawn_handler(seeded_cache(), false);

        assert_eq!(snapshot.version(ResourceType::Cluster), 0);
        event_tx.send(Kind::Service).await.unwrap();

        // paused time auto-advances through the holdoff.
        tokio::time::sleep(HOLDOFF + Duration::from_millis(50)).await;
        assert!(snapshot.version(ResourceType::Cluster) > 0);
        assert!(snapshot.version(ResourceType::Listener) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_becoming_leader_rebuilds_immediately_and_writes_status() {
        let (snapshot, _event_tx, leader_tx, mut status_rx) = spawn_handler(seeded_cache(), false);

        leader_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(snapshot.version(ResourceType::Cluster) > 0);
        let statuses = status_rx.recv().await.unwrap();
        assert!(statuses.iter().any(|s| s.kind == "HTTPProxy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_leader_updates_caches_but_not_status() {
        let (snapshot, event_tx, _leader_tx, mut status_rx) = spawn_handler(seeded_cache(), false);

        event_tx.send(Kind::Service).await.unwrap();
        tokio::time::sleep(MAX_DELAY + Duration::from_millis(50)).await;

        // the replica still serves xDS identically...
        assert!(snapshot.version(ResourceType::Cluster) > 0);
        // ...but never writes status.
        assert!(status_rx.try_recv().is_err());
    }

    #[test]
    fn test_quiet_coalescer_has_no_deadline() {
        let mut c = Coalescer::new(HOLDOFF, MAX_DELAY);
        assert_eq!(c.deadline(), None);
        assert!(!c.pending());

        c.event(Instant::now());
        c.fire();
        assert_eq!(c.deadline(), None);
    }

    #[test]
    fn test_single_event_fires_on_holdoff() {
        let start = Instant::now();
        let mut c = Coalescer::new(HOLDOFF, MAX_DELAY);

        c.event(start);
        // holdoff < max delay, so a lone event fires at the holdoff.
        assert_eq!(c.deadline(), Some(start + HOLDOFF));
    }
}
