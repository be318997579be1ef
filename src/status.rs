//! The status writer: persists build conditions back to the API server.
//!
//! Writes are serialized (one task, one object at a time) and
//! idempotent: a condition whose content hasn't changed keeps its
//! existing `lastTransitionTime`, and a status that already matches is
//! not written at all. Failures retry with capped backoff until a newer
//! rebuild supersedes the whole batch.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition as MetaCondition, Time};
use kube::api::{Patch, PatchParams};
use kube::Api;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::apis::{HTTPProxy, HTTPProxyStatus};
use crate::cache::ObjectKey;
use crate::dag::Condition;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// The controller name recorded on HTTPRoute parent statuses.
const CONTROLLER_NAME: &str = "gantry.dev/gantry";

/// One object's worth of conditions from a rebuild.
#[derive(Clone, Debug)]
pub(crate) struct StatusUpdate {
    pub kind: &'static str,
    pub key: ObjectKey,
    pub generation: i64,
    pub conditions: Vec<Condition>,
}

pub(crate) struct StatusWriter {
    client: kube::Client,
    updates: mpsc::Receiver<Vec<StatusUpdate>>,
    /// The Gateway parent recorded on HTTPRoute statuses.
    gateway_ref: Option<ObjectKey>,
}

impl StatusWriter {
    pub(crate) fn new(
        client: kube::Client,
        updates: mpsc::Receiver<Vec<StatusUpdate>>,
        gateway_ref: Option<ObjectKey>,
    ) -> Self {
        Self {
            client,
            updates,
            gateway_ref,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut pending: Option<Vec<StatusUpdate>> = None;

        loop {
            let batch = match pending.take() {
                Some(batch) => batch,
                None => match self.updates.recv().await {
                    Some(batch) => batch,
                    None => return,
                },
            };

            let mut items = batch.into_iter();
            'batch: while let Some(update) = items.next() {
                let mut backoff = INITIAL_BACKOFF;
                loop {
                    let attempt =
                        tokio::time::timeout(WRITE_TIMEOUT, self.write(&update)).await;
                    match attempt {
                        Ok(Ok(())) => break,
                        Ok(Err(err)) => {
                            warn!(
                                kind = update.kind,
                                object = %update.key,
                                err = %err,
                                "status write failed"
                            );
                        }
                        Err(_) => {
                            warn!(
                                kind = update.kind,
                                object = %update.key,
                                "status write timed out"
                            );
                        }
                    }

                    // back off, but let a newer rebuild supersede the
                    // rest of this batch instead of blocking behind it.
                    tokio::select! {
                        newer = self.updates.recv() => {
                            match newer {
                                Some(batch) => {
                                    debug!("a newer rebuild superseded pending status writes");
                                    pending = Some(batch);
                                    break 'batch;
                                }
                                None => return,
                            }
                        }
                        _ = tokio::time::sleep(backoff) => {
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    async fn write(&self, update: &StatusUpdate) -> Result<(), kube::Error> {
        match update.kind {
            "HTTPProxy" => self.write_proxy(update).await,
            "HTTPRoute" => self.write_httproute(update).await,
            other => {
                debug!(kind = other, "no status writer for kind");
                Ok(())
            }
        }
    }

    async fn write_proxy(&self, update: &StatusUpdate) -> Result<(), kube::Error> {
        let api: Api<HTTPProxy> = Api::namespaced(self.client.clone(), &update.key.namespace);
        let current = api.get_status(&update.key.name).await?;

        let existing = current
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        let conditions = merge_conditions(&update.conditions, existing, update.generation);

        if existing == conditions.as_slice() {
            return Ok(());
        }

        let summary = summarize(&update.conditions);
        let status = HTTPProxyStatus {
            current_status: Some(summary.0.to_string()),
            description: Some(summary.1),
            conditions,
        };

        api.patch_status(
            &update.key.name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        debug!(object = %update.key, "wrote HTTPProxy status");
        Ok(())
    }

    async fn write_httproute(&self, update: &StatusUpdate) -> Result<(), kube::Error> {
        use gateway_api::apis::standard::httproutes::{
            HTTPRoute, HTTPRouteStatus, HTTPRouteStatusParents, HTTPRouteStatusParentsParentRef,
        };

        let Some(gateway) = &self.gateway_ref else {
            return Ok(());
        };

        let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), &update.key.namespace);
        let current = api.get_status(&update.key.name).await?;

        let existing = current
            .status
            .as_ref()
            .map(|s| s.parents.as_slice())
            .unwrap_or_default();
        let existing_ours = existing
            .iter()
            .find(|p| p.controller_name == CONTROLLER_NAME)
            .and_then(|p| p.conditions.as_deref())
            .unwrap_or_default();

        let conditions = merge_conditions(&update.conditions, existing_ours, update.generation);
        if existing_ours == conditions.as_slice() {
            return Ok(());
        }

        // keep other controllers' parent statuses intact.
        let mut parents: Vec<HTTPRouteStatusParents> = existing
            .iter()
            .filter(|p| p.controller_name != CONTROLLER_NAME)
            .cloned()
            .collect();
        parents.push(HTTPRouteStatusParents {
            controller_name: CONTROLLER_NAME.to_string(),
            parent_ref: HTTPRouteStatusParentsParentRef {
                group: Some("gateway.networking.k8s.io".to_string()),
                kind: Some("Gateway".to_string()),
                name: gateway.name.clone(),
                namespace: Some(gateway.namespace.clone()),
                port: None,
                section_name: None,
            },
            conditions: Some(conditions),
        });

        api.patch_status(
            &update.key.name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({
                "status": HTTPRouteStatus { parents },
            })),
        )
        .await?;
        debug!(object = %update.key, "wrote HTTPRoute status");
        Ok(())
    }
}

/// Convert a build's conditions into metav1 conditions, preserving the
/// transition time of any condition whose content hasn't changed and
/// never moving `observedGeneration` backwards.
fn merge_conditions(
    computed: &[Condition],
    existing: &[MetaCondition],
    generation: i64,
) -> Vec<MetaCondition> {
    let now = Time(k8s_openapi::chrono::Utc::now());

    computed
        .iter()
        .map(|condition| {
            let status = if condition.status { "True" } else { "False" };
            let mut meta = MetaCondition {
                type_: condition.condition_type.to_string(),
                status: status.to_string(),
                reason: condition.reason.as_str().to_string(),
                message: condition.message.clone(),
                observed_generation: Some(generation),
                last_transition_time: now.clone(),
            };

            for previous in existing {
                let unchanged = previous.type_ == meta.type_
                    && previous.status == meta.status
                    && previous.reason == meta.reason
                    && previous.message == meta.message;
                let stale = previous.observed_generation.unwrap_or(0) > generation;
                if unchanged || stale {
                    meta.last_transition_time = previous.last_transition_time.clone();
                    meta.observed_generation = previous.observed_generation;
                    break;
                }
            }

            meta
        })
        .collect()
}

fn summarize(conditions: &[Condition]) -> (&'static str, String) {
    if conditions.iter().any(|c| c.condition_type == "Orphaned" && c.status) {
        return ("orphaned", "this HTTPProxy is not part of a delegation chain from a root".to_string());
    }
    match conditions.iter().find(|c| c.condition_type == "Valid" && !c.status) {
        Some(invalid) => ("invalid", invalid.message.clone()),
        None => ("valid", "valid HTTPProxy".to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dag::Reason;

    fn valid_condition() -> Condition {
        Condition {
            condition_type: "Valid",
            status: true,
            reason: Reason::Valid,
            message: "valid configuration".to_string(),
        }
    }

    fn meta(type_: &str, status: &str, reason: &str, message: &str, gen: i64) -> MetaCondition {
        MetaCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: Some(gen),
            last_transition_time: Time(k8s_openapi::chrono::Utc::now()
                - k8s_openapi::chrono::Duration::hours(1)),
        }
    }

    #[test]
    fn test_unchanged_condition_keeps_transition_time() {
        let existing = vec![meta("Valid", "True", "Valid", "valid configuration", 1)];
        let merged = merge_conditions(&[valid_condition()], &existing, 2);

        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].last_transition_time, existing[0].last_transition_time,
            "identical content must not move lastTransitionTime"
        );
    }

    #[test]
    fn test_changed_condition_moves_transition_time() {
        let existing = vec![meta(
            "Valid",
            "False",
            "ServiceUnresolvedReference",
            "service missing",
            1,
        )];
        let merged = merge_conditions(&[valid_condition()], &existing, 2);

        assert_ne!(merged[0].last_transition_time, existing[0].last_transition_time);
        assert_eq!(merged[0].status, "True");
        assert_eq!(merged[0].observed_generation, Some(2));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let first = merge_conditions(&[valid_condition()], &[], 1);
        let second = merge_conditions(&[valid_condition()], &first, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_summary() {
        assert_eq!(summarize(&[valid_condition()]).0, "valid");

        let invalid = Condition {
            condition_type: "Valid",
            status: false,
            reason: Reason::IncludeCreatesCycle,
            message: "cycle".to_string(),
        };
        let (status, description) = summarize(&[invalid]);
        assert_eq!(status, "invalid");
        assert_eq!(description, "cycle");

        let orphaned = Condition {
            condition_type: "Orphaned",
            status: true,
            reason: Reason::Orphaned,
            message: "orphaned".to_string(),
        };
        assert_eq!(summarize(&[orphaned]).0, "orphaned");
    }
}
