//! The Check Runner: one cooperative task per registered HealthCheck.
//!
//! Modeled the way this codebase models every other long-running per-entity
//! daemon — an owned task communicating over channels, driven by a `select!`
//! loop reacting to a timer and to external commands — generalized here to
//! the Idle/Launching/Running/Reporting/TimedOut/Cancelling/Waiting/Stopped
//! state machine.

use crate::config::Config;
use crate::crd::{HealthCheck, HealthCheckStatus};
use crate::metrics;
use crate::pod_template::{self, run_label_selector, PodTemplateParams};
use crate::registry;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use error::*;
use futures_util::{pin_mut, select, FutureExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, Patch, PatchParams, PropagationPolicy};
use kube::{Api, ResourceExt};
use result::Result;
use serde_json::json;
use std::sync::Arc;
use term_colors::*;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

pub const RUN_DEADLINE_EXCEEDED_ERROR: &str = "deadline exceeded";

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub ok: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    UnknownOrStaleUuid,
}

enum RunnerCommand {
    Stop(oneshot::Sender<()>),
    Report(String, IngestReport, oneshot::Sender<IngestOutcome>),
    QueryUuid(oneshot::Sender<Option<String>>),
}

/// A cloneable, cheap-to-hold reference into a running Runner's command
/// channel. Dropping every clone lets the Runner's task observe a closed
/// channel and fail safe, but the Registry is expected to call `stop`
/// explicitly rather than rely on drop-based teardown.
#[derive(Clone)]
pub struct RunnerHandle {
    commands: mpsc::Sender<RunnerCommand>,
}

impl RunnerHandle {
    /// Cancels the Runner and waits for its teardown (pod delete, status
    /// clear) to finish.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RunnerCommand::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Hands a report to the Runner. The Runner itself decides whether the
    /// UUID is still live; this is what gives the Running→Reporting
    /// transition its single-writer guarantee.
    pub async fn report(&self, uuid: String, report: IngestReport) -> Result<IngestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RunnerCommand::Report(uuid, report, tx))
            .await
            .map_err(|_| RunnerUnresponsive {})?;
        rx.await.map_err(|_| RunnerUnresponsive {}.into())
    }

    /// Returns the Runner's current outstanding UUID, if any. Used by the
    /// Reaper to decide whether a pod's `uuid` label is stale.
    pub async fn active_uuid(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RunnerCommand::QueryUuid(tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }
}

#[derive(Error, AcmError, HttpCode, Kind, Debug)]
#[code(Status::ServiceUnavailable)]
#[error("the check runner for this resource has stopped responding")]
pub struct RunnerUnresponsive {}

/// Spawns a Runner for `check` and returns a handle to it. The Runner starts
/// in Idle and immediately computes its first tick.
pub fn spawn(check: HealthCheck) -> RunnerHandle {
    let (tx, rx) = mpsc::channel(8);
    let key = (
        check.metadata.namespace.clone().unwrap_or_default(),
        check.metadata.name.clone().unwrap_or_default(),
    );
    let daemon = RunnerDaemon {
        key,
        check,
        commands: rx,
        config: Arc::new(Config::from_env()),
    };
    tokio::spawn(daemon.run());
    RunnerHandle { commands: tx }
}

struct RunnerDaemon {
    key: (String, String),
    check: HealthCheck,
    commands: mpsc::Receiver<RunnerCommand>,
    config: Arc<Config>,
}

enum WaitEvent {
    TickReached,
    Command(Option<RunnerCommand>),
}

enum RunEvent {
    Report(String, IngestReport, oneshot::Sender<IngestOutcome>),
    Deadline,
    Cancelled(oneshot::Sender<()>),
    Stray(RunnerCommand),
}

impl RunnerDaemon {
    async fn run(mut self) {
        let (namespace, name) = self.key.clone();
        let health_checks: Api<HealthCheck> = k8s::client::new_namespaced(&namespace).await;
        let pods: Api<Pod> = k8s::client::new_namespaced(&namespace).await;

        loop {
            // ----------------------------------------------------------------
            // Idle / Waiting: park until the next tick or a command arrives.
            // ----------------------------------------------------------------
            let next_tick = self.next_tick_instant();
            let event = {
                let tick = tokio::time::sleep_until(next_tick).fuse();
                let cmd = self.commands.recv().fuse();
                pin_mut!(tick, cmd);
                select! {
                    _ = tick => WaitEvent::TickReached,
                    c = cmd => WaitEvent::Command(c),
                }
            };
            match event {
                WaitEvent::TickReached => (),
                WaitEvent::Command(None) => {
                    warn!("check runner for {}/{} lost its command channel, stopping", cyan(&namespace), cyan(&name));
                    return;
                }
                WaitEvent::Command(Some(RunnerCommand::Stop(ack))) => {
                    self.cancel(&health_checks, &pods).await;
                    let _ = ack.send(());
                    info!("check runner for {}/{} stopped", cyan(&namespace), cyan(&name));
                    return;
                }
                WaitEvent::Command(Some(RunnerCommand::Report(_, _, reply))) => {
                    let _ = reply.send(IngestOutcome::UnknownOrStaleUuid);
                    continue;
                }
                WaitEvent::Command(Some(RunnerCommand::QueryUuid(reply))) => {
                    let _ = reply.send(None);
                    continue;
                }
            }

            if self.terminal_single_run() {
                debug!("check {}/{} is single-run and already settled; no further ticks", cyan(&namespace), cyan(&name));
                // Park forever on the command channel; only Stop will move us.
                while let Some(cmd) = self.commands.recv().await {
                    match cmd {
                        RunnerCommand::Stop(ack) => {
                            self.cancel(&health_checks, &pods).await;
                            let _ = ack.send(());
                            return;
                        }
                        RunnerCommand::Report(_, _, reply) => {
                            let _ = reply.send(IngestOutcome::UnknownOrStaleUuid);
                        }
                        RunnerCommand::QueryUuid(reply) => {
                            let _ = reply.send(None);
                        }
                    }
                }
                return;
            }

            // ----------------------------------------------------------------
            // Launching
            // ----------------------------------------------------------------
            let uuid = uuid::Uuid::new_v4().to_string();
            let started_at = Instant::now();
            let now_unix = chrono::Utc::now().timestamp();
            let timeout = self.current_timeout();
            let deadline_unix = now_unix + timeout.as_secs() as i64;
            let deadline_instant = started_at + timeout;

            if let Err(err) = self
                .write_status_launching(&health_checks, &uuid, now_unix)
                .await
            {
                warn!(
                    "failed to record launch of check {}/{}: {:?}; waiting for next tick",
                    cyan(&namespace), cyan(&name), err
                );
                continue;
            }
            registry::index_uuid(self.key.clone(), uuid.clone()).await;
            metrics::record_extra_labels(&namespace, &name, &self.check.spec.extra_labels, &self.config);

            let pod = pod_template::materialize(
                &self.check,
                &self.check.spec,
                &PodTemplateParams {
                    controller_id: &self.config.controller_id,
                    reporting_base_url: &self.config.reporting_base_url,
                    run_uuid: &uuid,
                    deadline_unix,
                },
            );

            let created = pods.create(&kube::api::PostParams::default(), &pod).await;
            let pod_name = match created {
                Ok(created) => created.name_any(),
                Err(err) => {
                    warn!("pod creation failed for check {}/{}: {:?}", cyan(&namespace), cyan(&name), err);
                    registry::deindex_uuid(&uuid).await;
                    let elapsed = started_at.elapsed().as_secs_f64();
                    self.apply_result(
                        &health_checks,
                        false,
                        vec![format!("pod creation failed: {:?}", err)],
                        elapsed,
                    )
                    .await;
                    continue;
                }
            };
            info!(
                "launched checker pod {} for check {}/{} with uuid {}",
                cyan(&pod_name), cyan(&namespace), cyan(&name), cyan(&uuid)
            );
            metrics::record_pod_name(&namespace, &name, &pod_name);
            metrics::record_scheduling(
                &namespace,
                &name,
                now_unix + self.check.spec.run_interval_seconds as i64,
                timeout.as_secs(),
                self.check.spec.run_interval_seconds,
            );

            // ----------------------------------------------------------------
            // Running: park until report, deadline, or cancellation.
            // ----------------------------------------------------------------
            let event = loop {
                let deadline_sleep = tokio::time::sleep_until(deadline_instant).fuse();
                let cmd = self.commands.recv().fuse();
                pin_mut!(deadline_sleep, cmd);
                let polled = select! {
                    _ = deadline_sleep => RunEvent::Deadline,
                    c = cmd => match c {
                        Some(RunnerCommand::Report(report_uuid, report, reply)) => {
                            RunEvent::Report(report_uuid, report, reply)
                        }
                        Some(RunnerCommand::Stop(ack)) => RunEvent::Cancelled(ack),
                        Some(other) => RunEvent::Stray(other),
                        None => RunEvent::Deadline,
                    },
                };
                match polled {
                    RunEvent::Stray(RunnerCommand::QueryUuid(reply)) => {
                        let _ = reply.send(Some(uuid.clone()));
                        continue;
                    }
                    RunEvent::Stray(_) => continue,
                    other => break other,
                }
            };

            match event {
                RunEvent::Report(report_uuid, report, reply) if report_uuid == uuid => {
                    let _ = reply.send(IngestOutcome::Accepted);
                    let elapsed = started_at.elapsed().as_secs_f64();
                    info!(
                        "check {}/{} reported ok={} in {:.3}s",
                        cyan(&namespace), cyan(&name), report.ok, elapsed
                    );
                    self.apply_result(&health_checks, report.ok, report.errors, elapsed).await;
                    registry::deindex_uuid(&uuid).await;
                    self.delete_pod_orphan_safe(&pods, &pod_name).await;
                }
                RunEvent::Report(_, _, reply) => {
                    // Stale UUID arrived for a run that has already moved on.
                    let _ = reply.send(IngestOutcome::UnknownOrStaleUuid);
                    continue;
                }
                RunEvent::Deadline => {
                    warn!(
                        "check {}/{} exceeded its deadline of {:?}",
                        cyan(&namespace), cyan(&name), timeout
                    );
                    registry::deindex_uuid(&uuid).await;
                    let elapsed = started_at.elapsed().as_secs_f64();
                    self.apply_result(
                        &health_checks,
                        false,
                        vec![RUN_DEADLINE_EXCEEDED_ERROR.to_string()],
                        elapsed,
                    )
                    .await;
                    self.delete_pod_orphan_safe(&pods, &pod_name).await;
                }
                RunEvent::Cancelled(ack) => {
                    registry::deindex_uuid(&uuid).await;
                    self.delete_pod_orphan_safe(&pods, &pod_name).await;
                    self.clear_uuid(&health_checks).await;
                    let _ = ack.send(());
                    info!("check runner for {}/{} cancelled mid-run", cyan(&namespace), cyan(&name));
                    return;
                }
            }
        }
    }

    fn terminal_single_run(&self) -> bool {
        self.check.spec.single_run && self.check.status.as_ref().map(|s| s.terminal).unwrap_or(false)
    }

    fn current_timeout(&self) -> Duration {
        let timeout = self.check.spec.timeout_seconds;
        let interval = self.check.spec.run_interval_seconds;
        Duration::from_secs(if timeout > interval { interval } else { timeout })
    }

    /// Next tick = max(lastRunUnix + runInterval, now + 1s); never ticks
    /// again once a singleRun check has settled.
    fn next_tick_instant(&self) -> Instant {
        let now_unix = chrono::Utc::now().timestamp();
        let last_run = self.check.status.as_ref().map(|s| s.last_run_unix).unwrap_or(0);
        if last_run == 0 {
            return Instant::now();
        }
        let interval = self.check.spec.run_interval_seconds as i64;
        let earliest = std::cmp::max(last_run + interval, now_unix + 1);
        let delay = (earliest - now_unix).max(1) as u64;
        Instant::now() + Duration::from_secs(delay)
    }

    async fn write_status_launching(
        &mut self,
        api: &Api<HealthCheck>,
        uuid: &str,
        now_unix: i64,
    ) -> Result<()> {
        let namespace = self.key.0.clone();
        let patch = json!({
            "status": {
                "currentUuid": uuid,
                "lastRunUnix": now_unix,
                "namespace": namespace,
            }
        });
        self.patch_status_retrying(api, &patch).await?;
        if let Some(status) = self.check.status.as_mut() {
            status.current_uuid = uuid.to_string();
            status.last_run_unix = now_unix;
            status.namespace = namespace;
        } else {
            self.check.status = Some(HealthCheckStatus {
                current_uuid: uuid.to_string(),
                last_run_unix: now_unix,
                namespace,
                ..Default::default()
            });
        }
        Ok(())
    }

    async fn apply_result(
        &mut self,
        api: &Api<HealthCheck>,
        ok: bool,
        errors: Vec<String>,
        run_duration_seconds: f64,
    ) {
        let now_unix = chrono::Utc::now().timestamp();
        let mut status = self.check.status.clone().unwrap_or_default();
        status.apply_result(ok, errors.clone(), now_unix, run_duration_seconds);
        if self.check.spec.single_run {
            status.terminal = true;
        }
        let patch = json!({
            "status": {
                "ok": status.ok,
                "errors": status.errors,
                "currentUuid": "",
                "lastRunUnix": status.last_run_unix,
                "lastRunDurationSeconds": status.last_run_duration_seconds,
                "lastOkUnix": status.last_ok_unix,
                "lastFailureUnix": status.last_failure_unix,
                "successCount": status.success_count,
                "failureCount": status.failure_count,
                "consecutiveFailures": status.consecutive_failures,
                "namespace": status.namespace,
                "terminal": status.terminal,
            }
        });
        if let Err(err) = self.patch_status_retrying(api, &patch).await {
            error!(
                "failed to persist check result for {}/{}: {:?}",
                cyan(&self.key.0), cyan(&self.key.1), err
            );
        }
        self.check.status = Some(status.clone());
        metrics::record_check_result(&self.key.0, &self.key.1, &status);
    }

    async fn clear_uuid(&mut self, api: &Api<HealthCheck>) {
        let patch = json!({ "status": { "currentUuid": "" } });
        let _ = self.patch_status_retrying(api, &patch).await;
        if let Some(status) = self.check.status.as_mut() {
            status.current_uuid.clear();
        }
    }

    /// Retries a status-subresource patch on API conflict, the same backoff
    /// policy this codebase already uses for transient K8s failures.
    async fn patch_status_retrying(
        &self,
        api: &Api<HealthCheck>,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..ExponentialBackoff::default()
        };
        let name = self.key.1.clone();
        loop {
            let result = api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(resp)) if resp.code == 409 => match backoff.next_backoff() {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => return Err(k8s::errors::ApiError::from(kube::Error::Api(resp)).into()),
                },
                Err(err) => return Err(k8s::errors::ApiError::from(err).into()),
            }
        }
    }

    async fn delete_pod_orphan_safe(&self, pods: &Api<Pod>, pod_name: &str) {
        let params = DeleteParams {
            dry_run: false,
            grace_period_seconds: None,
            propagation_policy: Some(PropagationPolicy::Foreground),
            preconditions: None,
        };
        match pods.delete(pod_name, &params).await {
            Ok(_) => (),
            Err(kube::Error::Api(resp)) if resp.code == 404 => (),
            Err(err) => warn!("failed to delete checker pod {}: {:?}", cyan(pod_name), err),
        }
    }

    async fn cancel(&mut self, health_checks: &Api<HealthCheck>, pods: &Api<Pod>) {
        if let Some(status) = self.check.status.clone() {
            if status.has_outstanding_run() {
                let selector = run_label_selector(
                    &self.config.controller_id,
                    &self.key.0,
                    &self.key.1,
                    &status.current_uuid,
                );
                if let Ok(found) = k8s::list_by_labels(pods, &selector_pairs(&selector)).await {
                    for pod in found {
                        self.delete_pod_orphan_safe(pods, &pod.name_any()).await;
                    }
                }
                registry::deindex_uuid(&status.current_uuid).await;
                self.clear_uuid(health_checks).await;
            }
        }
        metrics::remove_check(&self.key.0, &self.key.1);
    }
}

fn selector_pairs(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HealthCheckSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use std::collections::BTreeMap;

    fn daemon_with_status(status: Option<HealthCheckStatus>, single_run: bool) -> RunnerDaemon {
        let mut check = HealthCheck::new(
            "demo",
            HealthCheckSpec {
                run_interval_seconds: 60,
                timeout_seconds: 10,
                single_run,
                extra_labels: BTreeMap::new(),
                extra_annotations: BTreeMap::new(),
                pod_spec: PodTemplateSpec::default(),
            },
        );
        check.metadata.namespace = Some("kh".to_string());
        check.status = status;
        let (_tx, rx) = mpsc::channel(1);
        RunnerDaemon {
            key: ("kh".to_string(), "demo".to_string()),
            check,
            commands: rx,
            config: Arc::new(Config::from_env()),
        }
    }

    #[test]
    fn current_timeout_clamps_to_interval() {
        let mut daemon = daemon_with_status(None, false);
        daemon.check.spec.timeout_seconds = 120;
        daemon.check.spec.run_interval_seconds = 60;
        assert_eq!(daemon.current_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn terminal_single_run_requires_both_flags() {
        let not_terminal = daemon_with_status(
            Some(HealthCheckStatus { terminal: false, ..Default::default() }),
            true,
        );
        assert!(!not_terminal.terminal_single_run());

        let settled = daemon_with_status(
            Some(HealthCheckStatus { terminal: true, ..Default::default() }),
            true,
        );
        assert!(settled.terminal_single_run());

        let non_single_run = daemon_with_status(
            Some(HealthCheckStatus { terminal: true, ..Default::default() }),
            false,
        );
        assert!(!non_single_run.terminal_single_run());
    }

    #[test]
    fn selector_pairs_parses_label_selector() {
        let pairs = selector_pairs("a=b,c=d");
        assert_eq!(pairs, vec![("a", "b"), ("c", "d")]);
    }
}
