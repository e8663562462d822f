//! The Reaper: a periodic sweep that deletes checker pods no longer
//! authorized by any check, adapting this codebase's orphan-detection idiom
//! (originally written to find pods left behind by a dead controller
//! process) to the four deletion policies the scheduler's invariants
//! require.

use crate::config::Config;
use crate::crd::HealthCheck;
use crate::labels::{LABEL_CHECK, LABEL_CONTROLLER, LABEL_NAMESPACE, LABEL_UUID};
use crate::metrics;
use crate::registry;
use k8s::PodExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PropagationPolicy};
use kube::{Api, ResourceExt};
use term_colors::*;
use tokio::sync::oneshot;

/// Runs the sweep loop until `stop` resolves. Intended to be spawned under
/// the Leader Gate's root scope; non-leaders never run a Reaper instance.
pub async fn run(config: Config, mut stop: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval(config.reaper_sweep_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(&config).await;
            }
            _ = &mut stop => {
                info!("reaper stopping");
                return;
            }
        }
    }
}

async fn sweep(config: &Config) {
    let started = tokio::time::Instant::now();
    let pods: Api<Pod> = match &config.namespace {
        Some(namespace) => k8s::client::new_namespaced(namespace).await,
        None => k8s::client::new_cluster_scoped().await,
    };

    let selector = format!("{}={}", LABEL_CONTROLLER, config.controller_id);
    let candidates = match pods.list(&ListParams::default().labels(&selector)).await {
        Ok(list) => list.items,
        Err(err) => {
            warn!("reaper failed to list candidate pods: {:?}", err);
            return;
        }
    };

    let registered = registry::registered_keys().await;

    for pod in candidates {
        if let Some(reason) = decision(&pod, &registered, config, check_resource_exists).await {
            delete(&pods, &pod, reason).await;
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    metrics::record_reaper_sweep(elapsed);
}

/// Decides whether `pod` should be reaped, and if so, under which reason.
/// Checked in priority order: missing/deleted check first, then stale UUID,
/// then deadline overrun. `check_exists` is injected so the policy logic can
/// be exercised without a live API server; `sweep` always passes
/// `check_resource_exists`.
async fn decision<F, Fut>(
    pod: &Pod,
    registered: &[(String, String)],
    config: &Config,
    check_exists: F,
) -> Option<&'static str>
where
    F: FnOnce(String, String) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let check_name = labels.get(LABEL_CHECK)?.clone();
    let check_namespace = labels.get(LABEL_NAMESPACE).cloned().unwrap_or_default();
    let uuid = labels.get(LABEL_UUID).cloned().unwrap_or_default();
    let key = (check_namespace.clone(), check_name.clone());

    if !registered.iter().any(|k| *k == key) {
        // Distinguishes policy 4 (the HealthCheck was deleted out from under
        // its pod) from policy 1 (the pod's check label never corresponded
        // to any HealthCheck this replica knows about, e.g. a leftover from
        // before a rename, or a pod adopted before the watcher's first sync).
        return Some(if check_exists(check_namespace, check_name).await {
            "orphan-check-missing"
        } else {
            "orphan-check-deleted"
        });
    }

    let active_uuid = registry::active_uuid(&key).await;
    match &active_uuid {
        Some(active) if *active == uuid => (),
        _ => return Some("orphan-stale-uuid"),
    }

    if let Some(created) = pod.metadata.creation_timestamp.as_ref() {
        let created_unix = created.0.timestamp();
        let now_unix = chrono::Utc::now().timestamp();
        let grace = config.reaper_grace_period.as_secs() as i64;
        // The Runner itself is the authority on a single check's timeout;
        // the Reaper uses the sweep interval as a conservative outer bound
        // so it never races a Runner that is still legitimately Running.
        let outer_bound = config.reaper_sweep_interval.as_secs() as i64 + grace;
        if now_unix - created_unix > outer_bound && !pod.terminated() {
            return Some("deadline-exceeded");
        }
    }

    None
}

/// Asks the API server directly whether `namespace/name` still exists as a
/// `HealthCheck`, rather than trusting only this replica's local registry
/// (which only ever reflects checks the watcher has adopted).
async fn check_resource_exists(namespace: &str, name: &str) -> bool {
    let api: Api<HealthCheck> = k8s::client::new_namespaced(namespace).await;
    api.get(name).await.is_ok()
}

async fn delete(pods: &Api<Pod>, pod: &Pod, reason: &'static str) {
    let name = pod.name_any();
    let params = DeleteParams {
        dry_run: false,
        grace_period_seconds: None,
        propagation_policy: Some(PropagationPolicy::Foreground),
        preconditions: None,
    };
    match pods.delete(&name, &params).await {
        Ok(_) => {
            info!("reaper deleted pod {} ({})", cyan(&name), orange(reason));
            metrics::record_deleted_pod(reason);
        }
        Err(kube::Error::Api(resp)) if resp.code == 404 => (),
        Err(err) => warn!("reaper failed to delete pod {}: {:?}", cyan(&name), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn pod_with_labels(labels: BTreeMap<String, String>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.labels = Some(labels);
        pod.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod
    }

    fn pod_for(name: &str, namespace: &str, uuid: &str) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CHECK.to_string(), name.to_string());
        labels.insert(LABEL_NAMESPACE.to_string(), namespace.to_string());
        labels.insert(LABEL_UUID.to_string(), uuid.to_string());
        pod_with_labels(labels)
    }

    #[tokio::test]
    async fn missing_check_label_is_not_a_candidate() {
        let pod = pod_with_labels(BTreeMap::new());
        let config = Config::from_env();
        assert_eq!(
            decision(&pod, &[], &config, |_, _| async { true }).await,
            None
        );
    }

    #[tokio::test]
    async fn unregistered_check_still_present_is_orphan_missing() {
        let pod = pod_for("demo", "kh", "u1");
        let config = Config::from_env();
        assert_eq!(
            decision(&pod, &[], &config, |_, _| async { true }).await,
            Some("orphan-check-missing")
        );
    }

    #[tokio::test]
    async fn unregistered_check_actually_deleted_is_orphan_check_deleted() {
        let pod = pod_for("demo", "kh", "u1");
        let config = Config::from_env();
        assert_eq!(
            decision(&pod, &[], &config, |_, _| async { false }).await,
            Some("orphan-check-deleted")
        );
    }

    #[test]
    fn pod_with_no_container_statuses_is_not_terminated() {
        let pod = Pod::default();
        assert!(!pod.terminated());
    }

    #[test]
    fn pod_with_a_terminated_container_is_terminated() {
        use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus};

        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 0,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(pod.terminated());
    }
}
