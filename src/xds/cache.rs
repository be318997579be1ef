//! The four typed xDS resource caches.
//!
//! A rebuild replaces each type's contents wholesale and bumps one
//! shared version counter; per-type versions only move when that type's
//! bytes actually changed, so a stuttering rebuild never wakes a peer.
//! All four types are swapped before any notification goes out, which is
//! what lets a watcher read a consistent cross-type snapshot after a
//! single wakeup.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use enum_map::EnumMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use xds_api::pb::google::protobuf;

use crate::envoy::ResourceUpdate;
use crate::xds::resources::ResourceType;

/// A sorted, immutable view of one resource type's contents.
pub(crate) type ResourceMap = Arc<BTreeMap<String, protobuf::Any>>;

/// Create a new cache and its paired writer. The writer is the only way
/// to mutate the cache; there should be exactly one.
pub(crate) fn new_snapshot() -> (SnapshotCache, SnapshotWriter) {
    let inner = Arc::new(Inner::default());
    (
        SnapshotCache {
            inner: inner.clone(),
        },
        SnapshotWriter { inner },
    )
}

struct Inner {
    typed: EnumMap<ResourceType, TypedCache>,
    /// Bumped once per rebuild, shared by all four types.
    version: AtomicU64,
    notifications: broadcast::Sender<ResourceType>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            typed: Default::default(),
            version: AtomicU64::new(0),
            // enough room for a full rebuild's worth of notifications
            // for every type, a few times over.
            notifications: broadcast::Sender::new(16),
        }
    }
}

struct TypedCache {
    /// The version of the last update that changed this type.
    version: AtomicU64,
    resources: RwLock<ResourceMap>,
}

impl Default for TypedCache {
    fn default() -> Self {
        Self {
            version: AtomicU64::new(0),
            resources: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }
}

/// A cheaply cloneable read handle.
#[derive(Clone)]
pub(crate) struct SnapshotCache {
    inner: Arc<Inner>,
}

impl SnapshotCache {
    /// The version at which this type last changed. Zero means it has
    /// never been written.
    pub(crate) fn version(&self, rtype: ResourceType) -> u64 {
        self.inner.typed[rtype].version.load(Ordering::SeqCst)
    }

    /// A sorted snapshot of the type's contents. The returned map is
    /// immutable and shared, not copied.
    pub(crate) fn values(&self, rtype: ResourceType) -> ResourceMap {
        self.inner.typed[rtype]
            .resources
            .read()
            .expect("resource cache lock poisoned")
            .clone()
    }

    /// Subscribe to change notifications. Waking up means "at least one
    /// update happened to this type since you last looked".
    pub(crate) fn changes(&self) -> SnapshotChange {
        SnapshotChange {
            notifications: self.inner.notifications.subscribe(),
            _inner: self.inner.clone(),
        }
    }
}

/// A subscription to cache change notifications.
pub(crate) struct SnapshotChange {
    notifications: broadcast::Receiver<ResourceType>,
    // hold a reference to inner so the sender half can't drop while a
    // subscription is live.
    _inner: Arc<Inner>,
}

impl SnapshotChange {
    pub(crate) async fn changed(&mut self) -> ResourceType {
        loop {
            match self.notifications.recv().await {
                Ok(rtype) => return rtype,
                // a slow subscriber only loses intermediate wakeups, and
                // every wakeup says "go look at the cache", so skipping
                // ahead is safe.
                Err(RecvError::Lagged(n)) => {
                    warn!(dropped_notifications = %n, "cache subscription fell behind");
                }
                Err(RecvError::Closed) => {
                    panic!("snapshot cache dropped while a subscription was live. this is a bug")
                }
            }
        }
    }
}

/// The single write handle for a cache.
pub(crate) struct SnapshotWriter {
    inner: Arc<Inner>,
}

impl SnapshotWriter {
    /// Replace the contents of all four caches with one rebuild's
    /// output. Returns the new version.
    ///
    /// Types whose contents are unchanged keep their old version and
    /// produce no notification. Notifications for changed types are sent
    /// only after every type has been swapped.
    pub(crate) fn update(&mut self, update: ResourceUpdate) -> u64 {
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;

        let collections = [
            (ResourceType::Cluster, update.clusters),
            (ResourceType::ClusterLoadAssignment, update.endpoints),
            (ResourceType::Listener, update.listeners),
            (ResourceType::RouteConfiguration, update.routes),
        ];

        let mut changed = Vec::new();
        for (rtype, resources) in collections {
            let next: BTreeMap<String, protobuf::Any> = resources.into_iter().collect();
            let cache = &self.inner.typed[rtype];

            let mut current = cache
                .resources
                .write()
                .expect("resource cache lock poisoned");
            if **current == next {
                continue;
            }
            *current = Arc::new(next);
            drop(current);

            cache.version.store(version, Ordering::SeqCst);
            changed.push(rtype);
        }

        for rtype in changed {
            // an error just means no subscribers right now.
            let _ = self.inner.notifications.send(rtype);
        }

        version
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn any(type_url: &str, value: &[u8]) -> protobuf::Any {
        protobuf::Any {
            type_url: type_url.to_string(),
            value: value.to_vec(),
        }
    }

    fn update_with_cluster(name: &str, value: &[u8]) -> ResourceUpdate {
        ResourceUpdate {
            clusters: vec![(name.to_string(), any("test/cluster", value))],
            ..Default::default()
        }
    }

    #[test]
    fn test_update_replaces_contents() {
        let (cache, mut writer) = new_snapshot();

        writer.update(update_with_cluster("a", b"1"));
        assert_eq!(cache.values(ResourceType::Cluster).len(), 1);

        // the next update does not merge, it replaces.
        writer.update(update_with_cluster("b", b"2"));
        let values = cache.values(ResourceType::Cluster);
        assert_eq!(values.len(), 1);
        assert!(values.contains_key("b"));
    }

    #[test]
    fn test_versions_move_only_on_change() {
        let (cache, mut writer) = new_snapshot();

        let v1 = writer.update(update_with_cluster("a", b"1"));
        assert_eq!(cache.version(ResourceType::Cluster), v1);
        assert_eq!(
            cache.version(ResourceType::Listener),
            0,
            "untouched types stay unversioned"
        );

        // identical rebuild: global version bumps, per-type stays.
        let v2 = writer.update(update_with_cluster("a", b"1"));
        assert!(v2 > v1);
        assert_eq!(cache.version(ResourceType::Cluster), v1);

        let v3 = writer.update(update_with_cluster("a", b"changed"));
        assert_eq!(cache.version(ResourceType::Cluster), v3);
    }

    #[test]
    fn test_values_sorted_by_name() {
        let (cache, mut writer) = new_snapshot();

        writer.update(ResourceUpdate {
            clusters: vec![
                ("zz".to_string(), any("t", b"1")),
                ("aa".to_string(), any("t", b"2")),
                ("mm".to_string(), any("t", b"3")),
            ],
            ..Default::default()
        });

        let names: Vec<&String> = cache.values(ResourceType::Cluster).keys().collect();
        assert_eq!(names, vec!["aa", "mm", "zz"]);
    }

    #[tokio::test]
    async fn test_changed_types_notify_after_all_swaps() {
        let (cache, mut writer) = new_snapshot();
        let mut changes = cache.changes();

        writer.update(ResourceUpdate {
            clusters: vec![("c".to_string(), any("t", b"1"))],
            listeners: vec![("l".to_string(), any("t", b"2"))],
            ..Default::default()
        });

        // by the time the first notification is readable, both caches
        // must already hold the new contents.
        let first = changes.changed().await;
        assert_eq!(cache.values(ResourceType::Cluster).len(), 1);
        assert_eq!(cache.values(ResourceType::Listener).len(), 1);

        let second = changes.changed().await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_no_notification_for_identical_update() {
        let (cache, mut writer) = new_snapshot();

        writer.update(update_with_cluster("a", b"1"));
        let mut changes = cache.changes();
        writer.update(update_with_cluster("a", b"1"));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), changes.changed()).await;
        assert!(result.is_err(), "identical contents must not wake watchers");
    }

    #[test]
    fn test_identical_logical_state_identical_bytes() {
        // determinism: two caches fed the same update expose equal bytes.
        let (cache_a, mut writer_a) = new_snapshot();
        let (cache_b, mut writer_b) = new_snapshot();

        let make = || ResourceUpdate {
            clusters: vec![
                ("b".to_string(), any("t", b"2")),
                ("a".to_string(), any("t", b"1")),
            ],
            ..Default::default()
        };
        writer_a.update(make());
        writer_b.update(make());

        assert_eq!(
            cache_a.values(ResourceType::Cluster),
            cache_b.values(ResourceType::Cluster)
        );
    }
}
