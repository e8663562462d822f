//! The `HealthCheck` custom resource: spec, status, and invariant-preserving
//! helpers for mutating status. This is the one persisted resource the
//! entire controller revolves around.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the finalizer the watcher places on every `HealthCheck` it adopts.
/// Kept as a constant rather than a magic string scattered across call sites.
pub const FINALIZER: &str = "healthcheck.example.com/controller";

/// A user-declared health probe: how often to run it, how long a run may
/// take, and the pod template that executes it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "healthcheck.example.com",
    version = "v1",
    kind = "HealthCheck",
    plural = "healthchecks",
    status = "HealthCheckStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// How often a new run is scheduled, in seconds.
    pub run_interval_seconds: u64,

    /// How long a single run is allowed to take before it is considered
    /// timed out, in seconds. Must be `<= run_interval_seconds`; the watcher
    /// does not enforce this at admission time (no webhook is in scope here)
    /// but the runner clamps it defensively at launch.
    pub timeout_seconds: u64,

    /// When true, exactly one run is ever scheduled and the check then goes
    /// terminal; it is never rescheduled.
    #[serde(default)]
    pub single_run: bool,

    /// Labels merged onto the checker pod in addition to the controller's
    /// own identifying labels.
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,

    /// Annotations merged onto the checker pod.
    #[serde(default)]
    pub extra_annotations: BTreeMap<String, String>,

    /// The opaque pod template the controller instantiates for every run.
    /// Its own pod-level metadata (labels/annotations) is preserved and
    /// merged with the controller's, with the controller's identifying
    /// labels always taking precedence so a single-flight UUID can never be
    /// shadowed by user input.
    pub pod_spec: PodTemplateSpec,
}

/// The observed state of a `HealthCheck`, mutated only by the runner that
/// owns it (and cleared by the watcher on adoption/stop).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckStatus {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Empty iff no checker pod is currently authorized to report.
    #[serde(default)]
    pub current_uuid: String,
    #[serde(default)]
    pub last_run_unix: i64,
    #[serde(default)]
    pub last_run_duration_seconds: f64,
    #[serde(default)]
    pub last_ok_unix: i64,
    #[serde(default)]
    pub last_failure_unix: i64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub consecutive_failures: u64,
    #[serde(default)]
    pub namespace: String,
    /// Set once a `singleRun` check has completed its one and only run.
    #[serde(default)]
    pub terminal: bool,
}

impl HealthCheckStatus {
    /// True iff a checker pod is currently authorized to report for this
    /// check. `currentUUID == ""` iff no run is outstanding.
    pub fn has_outstanding_run(&self) -> bool {
        !self.current_uuid.is_empty()
    }

    /// Applies a completed run's result, preserving every status invariant:
    /// success/failure counters only ever increase by exactly one,
    /// `consecutiveFailures` resets to zero on success, `lastRunUnix` is
    /// monotonic, and `currentUuid` is always cleared last so the next
    /// Launching is permitted only after this call returns.
    pub fn apply_result(
        &mut self,
        ok: bool,
        errors: Vec<String>,
        now_unix: i64,
        run_duration_seconds: f64,
    ) {
        self.ok = ok;
        self.errors = errors;
        if ok {
            self.success_count += 1;
            self.last_ok_unix = now_unix;
            self.consecutive_failures = 0;
        } else {
            self.failure_count += 1;
            self.last_failure_unix = now_unix;
            self.consecutive_failures += 1;
        }
        self.last_run_duration_seconds = run_duration_seconds;
        self.current_uuid.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_result_clears_uuid_and_bumps_success() {
        let mut status = HealthCheckStatus {
            current_uuid: "abc".to_string(),
            ..Default::default()
        };
        status.apply_result(true, vec![], 100, 1.5);
        assert!(status.ok);
        assert_eq!(status.success_count, 1);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.current_uuid, "");
        assert!(!status.has_outstanding_run());
    }

    #[test]
    fn apply_result_increments_consecutive_failures() {
        let mut status = HealthCheckStatus {
            consecutive_failures: 2,
            failure_count: 2,
            ..Default::default()
        };
        status.apply_result(false, vec!["boom".to_string()], 100, 0.1);
        assert!(!status.ok);
        assert_eq!(status.failure_count, 3);
        assert_eq!(status.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut status = HealthCheckStatus {
            consecutive_failures: 5,
            ..Default::default()
        };
        status.apply_result(true, vec![], 1, 0.1);
        assert_eq!(status.consecutive_failures, 0);
    }
}
