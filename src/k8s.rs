use std::{collections::HashSet, fmt::Debug, future::Future, sync::Arc, time::Instant};

use futures::TryStreamExt;
use kube::{
    runtime::{
        self,
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt as _,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::apis::{HTTPProxy, TLSCertificateDelegation};

/// A Kubernetes resource kind gantry watches.
///
/// `modify` strips fields that churn without meaning (managed fields,
/// statuses we write ourselves) and `has_changed` decides whether an apply
/// event is worth a rebuild, so that resyncs and status-only updates don't
/// wake the whole pipeline.
pub(crate) trait KubeResource:
    Clone + Debug + DeserializeOwned + Resource<DynamicType = ()> + Send + Sync + 'static
{
    fn modify(&mut self);

    fn has_changed(&self, other: &Self) -> bool;
}

macro_rules! check_changed {
    ($old:expr, $new:expr) => {
        if $old != $new {
            return true;
        }
    };
}

impl KubeResource for k8s_openapi::api::core::v1::Service {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.meta().labels, other.meta().labels);
        check_changed!(self.meta().annotations, other.meta().annotations);
        check_changed!(self.spec, other.spec);

        false
    }
}

impl KubeResource for k8s_openapi::api::core::v1::Endpoints {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.subsets, other.subsets);

        false
    }
}

impl KubeResource for k8s_openapi::api::core::v1::Secret {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.type_, other.type_);
        check_changed!(self.data, other.data);

        false
    }
}

impl KubeResource for k8s_openapi::api::networking::v1::Ingress {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.meta().annotations, other.meta().annotations);
        check_changed!(self.spec, other.spec);

        false
    }
}

impl KubeResource for HTTPProxy {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
        // gantry writes proxy status itself. watching it back would mean
        // every status write triggers a rebuild.
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.meta().annotations, other.meta().annotations);
        check_changed!(self.meta().generation, other.meta().generation);

        false
    }
}

impl KubeResource for TLSCertificateDelegation {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.meta().generation, other.meta().generation);

        false
    }
}

impl KubeResource for gateway_api::apis::standard::gateways::Gateway {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.meta().generation, other.meta().generation);

        false
    }
}

impl KubeResource for gateway_api::apis::standard::httproutes::HTTPRoute {
    fn modify(&mut self) {
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.meta().generation, other.meta().generation);

        false
    }
}

pub(crate) type ChangedObjects<K> = Arc<HashSet<ObjectRef<K>>>;

/// A read handle on a single watched kind: the reflector store plus a
/// broadcast channel of debounced change sets.
pub(crate) struct Watch<K: KubeResource> {
    pub store: Store<K>,
    pub changes: broadcast::Sender<ChangedObjects<K>>,
}

/// Start watching a kind. Returns the watch handle and the future that
/// drives it; the future only returns on watch failure.
///
/// Changes are debounced for `debounce` before being broadcast so that the
/// flurry of events around a rollout turns into a handful of change sets.
pub(crate) fn watch<K: KubeResource>(
    api: kube::Api<K>,
    debounce: Duration,
) -> (
    Watch<K>,
    impl Future<Output = Result<(), watcher::Error>> + Send + 'static,
) {
    let (store, mut writer) = reflector::store();
    let (change_tx, _change_rx) = broadcast::channel(16);

    let watch = Watch {
        store: store.clone(),
        changes: change_tx.clone(),
    };

    let run = async move {
        let stream = runtime::watcher(api, watcher::Config::default().any_semantic())
            .default_backoff()
            .modify(K::modify);
        let mut stream = std::pin::pin!(stream);

        debug!(kind = K::kind(&()).as_ref(), "watch starting");

        let mut deadline = None;
        let mut changed: HashSet<ObjectRef<K>> = HashSet::new();
        loop {
            tokio::select! {
                biased;

                _ = sleep_until(&deadline) => {
                    if !changed.is_empty() {
                        let to_send: ChangedObjects<K> = Arc::new(std::mem::take(&mut changed));
                        if change_tx.send(to_send).is_err() {
                            debug!(kind = K::kind(&()).as_ref(), "watch ended: all receivers dropped");
                            return Ok(());
                        }
                    }
                    deadline.take();
                }
                event = stream.try_next() => {
                    let Some(event) = event? else {
                        return Ok(());
                    };
                    match &event {
                        // compare applies against the cached object so a
                        // no-op resync doesn't trigger a rebuild.
                        watcher::Event::Apply(new_obj) | watcher::Event::InitApply(new_obj) => {
                            let new_ref = ObjectRef::from_obj(new_obj);
                            let old_obj = store.get(&new_ref);
                            if old_obj.map_or(true, |old| old.has_changed(new_obj)) {
                                changed.insert(new_ref);
                                deadline.get_or_insert_with(|| Instant::now() + debounce);
                            }
                        }
                        watcher::Event::Delete(obj) => {
                            changed.insert(ObjectRef::from_obj(obj));
                            deadline.get_or_insert_with(|| Instant::now() + debounce);
                        }
                        watcher::Event::Init => {
                            trace!(kind = K::kind(&()).as_ref(), "watch (re)initializing");
                        }
                        // a re-list may have missed deletes. mark the union
                        // of old and new state changed and let the cache
                        // sort it out.
                        watcher::Event::InitDone => {
                            for obj in store.state() {
                                changed.insert(ObjectRef::from_obj(&obj));
                            }
                            deadline.get_or_insert_with(|| Instant::now() + debounce);
                        }
                    }
                    writer.apply_watcher_event(&event);
                }
            }
        }
    };

    (watch, run)
}

async fn sleep_until(deadline: &Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until((*d).into()).await,
        None => futures::future::pending().await,
    }
}

/// True if the error means the API (usually a CRD) isn't installed, as
/// opposed to a transient failure.
pub(crate) fn is_api_not_found(err: &watcher::Error) -> bool {
    matches!(
        err,
        watcher::Error::InitialListFailed(kube::Error::Api(e)) if e.code == 404
    )
}

pub(crate) fn namespace_and_name<K: kube::Resource>(obj: &K) -> Option<(&str, &str)> {
    let meta = obj.meta();
    let namespace = meta.namespace.as_deref()?;
    let name = meta.name.as_deref()?;
    Some((namespace, name))
}
