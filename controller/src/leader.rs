//! The Leader Gate: a cluster-wide `coordination.k8s.io/v1 Lease` that
//! elects exactly one active controller replica.
//!
//! Synthesized from this codebase's general event-loop shape (a `select!`
//! over a renewal timer and a shutdown signal) applied to the standard
//! Kubernetes lease object rather than adapted from a specific existing
//! daemon.

use crate::config::Config;
use crate::metrics;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Patch, PatchParams, PostParams};
use kube::Api;
use term_colors::*;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    Acquired,
    Lost,
}

/// Runs the acquire/renew loop until `shutdown` resolves, emitting
/// `LeadershipEvent`s on `events` whenever this replica's standing changes.
/// On shutdown while holding the lease, emits one final `Lost` so callers
/// always see a symmetric drain.
pub async fn run(config: Config, events: mpsc::Sender<LeadershipEvent>, mut shutdown: oneshot::Receiver<()>) {
    let leases: Api<Lease> = k8s::client::new_namespaced(&config.lease_namespace).await;
    let identity = format!("{}-{}", config.controller_id, uuid::Uuid::new_v4());
    let mut is_leader = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if is_leader {
                    let _ = events.send(LeadershipEvent::Lost).await;
                    metrics::set_leader(false);
                }
                info!("leader gate stopping");
                return;
            }
            _ = tokio::time::sleep(config.lease_renew_interval) => {
                let acquired = match try_acquire_or_renew(&leases, &config, &identity, is_leader).await {
                    Ok(acquired) => acquired,
                    Err(err) => {
                        warn!("lease renewal failed, treating as lost: {:?}", err);
                        false
                    }
                };
                if acquired && !is_leader {
                    is_leader = true;
                    info!("acquired leadership as {}", cyan(&identity));
                    metrics::set_leader(true);
                    let _ = events.send(LeadershipEvent::Acquired).await;
                } else if !acquired && is_leader {
                    is_leader = false;
                    warn!("lost leadership");
                    metrics::set_leader(false);
                    let _ = events.send(LeadershipEvent::Lost).await;
                }
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    config: &Config,
    identity: &str,
    currently_leader: bool,
) -> result::Result<bool> {
    let now = MicroTime(chrono::Utc::now());
    match leases.get(&config.lease_name).await {
        Ok(existing) => {
            let spec = existing.spec.unwrap_or_default();
            let held_by_us = spec.holder_identity.as_deref() == Some(identity);
            let expired = is_expired(&spec);
            if held_by_us || expired || currently_leader {
                let patch = Patch::Merge(serde_json::json!({
                    "spec": {
                        "holderIdentity": identity,
                        "leaseDurationSeconds": config.lease_duration.as_secs() as i32,
                        "renewTime": now,
                        "acquireTime": spec.acquire_time.clone().unwrap_or_else(|| now.clone()),
                    }
                }));
                leases
                    .patch(&config.lease_name, &PatchParams::default(), &patch)
                    .await
                    .map_err(k8s::errors::ApiError::from)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            let lease = Lease {
                metadata: kube::api::ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    namespace: Some(config.lease_namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    lease_duration_seconds: Some(config.lease_duration.as_secs() as i32),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                }),
            };
            leases
                .create(&PostParams::default(), &lease)
                .await
                .map_err(k8s::errors::ApiError::from)?;
            Ok(true)
        }
        Err(err) => Err(k8s::errors::ApiError::from(err).into()),
    }
}

fn is_expired(spec: &LeaseSpec) -> bool {
    let renew_time = match spec.renew_time.as_ref() {
        Some(t) => t.0,
        None => return true,
    };
    let duration = spec.lease_duration_seconds.unwrap_or(15) as i64;
    let now = chrono::Utc::now();
    (now - renew_time).num_seconds() > duration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_renew_time_is_expired() {
        let spec = LeaseSpec::default();
        assert!(is_expired(&spec));
    }

    #[test]
    fn fresh_renewal_is_not_expired() {
        let spec = LeaseSpec {
            renew_time: Some(MicroTime(chrono::Utc::now())),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(!is_expired(&spec));
    }

    #[test]
    fn stale_renewal_is_expired() {
        let stale = chrono::Utc::now() - chrono::Duration::seconds(60);
        let spec = LeaseSpec {
            renew_time: Some(MicroTime(stale)),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(is_expired(&spec));
    }
}
