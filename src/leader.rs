//! Lease-based leader election.
//!
//! The rest of gantry only ever sees a `watch::Receiver<bool>` that
//! flips to true when this replica holds the lease. With leader election
//! disabled the channel is simply born true.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono;
use kube::api::{ObjectMeta, PostParams};
use kube::Api;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "gantry-leader";
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct Leadership {
    rx: watch::Receiver<bool>,
    // kept alive so standalone subscriptions never observe a closed
    // channel.
    _tx: Option<watch::Sender<bool>>,
}

impl Leadership {
    /// No election: this replica is always the leader.
    pub(crate) fn standalone() -> Self {
        let (tx, rx) = watch::channel(true);
        Self { rx, _tx: Some(tx) }
    }

    /// Run a lease claim loop in the background.
    pub(crate) fn elect(client: kube::Client, namespace: String, identity: String) -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(claim_loop(client, namespace, identity, tx));
        Self { rx, _tx: None }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

/// What the claim loop should do with the lease it just read.
#[derive(Debug, PartialEq, Eq)]
enum Claim {
    /// Create or take over the lease.
    Acquire,
    /// We hold it; refresh renewTime.
    Renew,
    /// Someone else holds an unexpired lease.
    Follow,
}

fn decide(lease: Option<&Lease>, identity: &str, now: chrono::DateTime<chrono::Utc>) -> Claim {
    let Some(spec) = lease.and_then(|l| l.spec.as_ref()) else {
        return Claim::Acquire;
    };

    match spec.holder_identity.as_deref() {
        Some(holder) if holder == identity => Claim::Renew,
        Some(_) => {
            let renewed = spec
                .renew_time
                .as_ref()
                .or(spec.acquire_time.as_ref())
                .map(|t| t.0);
            let duration = spec
                .lease_duration_seconds
                .unwrap_or(LEASE_DURATION.as_secs() as i32);
            let expired = renewed
                .map(|t| now - t > chrono::Duration::seconds(duration as i64))
                .unwrap_or(true);
            if expired {
                Claim::Acquire
            } else {
                Claim::Follow
            }
        }
        None => Claim::Acquire,
    }
}

async fn claim_loop(
    client: kube::Client,
    namespace: String,
    identity: String,
    tx: watch::Sender<bool>,
) {
    let api: Api<Lease> = Api::namespaced(client, &namespace);
    let mut ticker = tokio::time::interval(RENEW_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let is_leader = match claim_once(&api, &identity).await {
            Ok(leader) => leader,
            Err(err) => {
                // conflicts are the normal outcome of losing a race;
                // anything else is worth a warning. either way we are
                // not the leader until a claim succeeds.
                match &err {
                    kube::Error::Api(e) if e.code == 409 => {
                        debug!("lost a lease update race");
                    }
                    _ => warn!(err = %err, "lease claim failed"),
                }
                false
            }
        };

        if *tx.borrow() != is_leader {
            info!(leader = is_leader, identity = %identity, "leadership changed");
        }
        if tx.send(is_leader).is_err() {
            return;
        }
    }
}

async fn claim_once(api: &Api<Lease>, identity: &str) -> Result<bool, kube::Error> {
    let now = chrono::Utc::now();
    let current = api.get_opt(LEASE_NAME).await?;

    match decide(current.as_ref(), identity, now) {
        Claim::Follow => Ok(false),
        Claim::Renew => {
            let mut lease = current.expect("renew implies the lease exists");
            if let Some(spec) = lease.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
            }
            api.replace(LEASE_NAME, &PostParams::default(), &lease).await?;
            Ok(true)
        }
        Claim::Acquire => {
            match current {
                Some(mut lease) => {
                    let transitions = lease
                        .spec
                        .as_ref()
                        .and_then(|s| s.lease_transitions)
                        .unwrap_or(0);
                    lease.spec = Some(LeaseSpec {
                        holder_identity: Some(identity.to_string()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                        lease_transitions: Some(transitions + 1),
                        ..Default::default()
                    });
                    api.replace(LEASE_NAME, &PostParams::default(), &lease).await?;
                }
                None => {
                    let lease = Lease {
                        metadata: ObjectMeta {
                            name: Some(LEASE_NAME.to_string()),
                            ..Default::default()
                        },
                        spec: Some(LeaseSpec {
                            holder_identity: Some(identity.to_string()),
                            acquire_time: Some(MicroTime(now)),
                            renew_time: Some(MicroTime(now)),
                            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                            lease_transitions: Some(0),
                            ..Default::default()
                        }),
                    };
                    api.create(&PostParams::default(), &lease).await?;
                }
            }
            Ok(true)
        }
    }
}

/// The identity this replica claims leases under.
pub(crate) fn identity() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| format!("gantry-{}", std::process::id()))
}
