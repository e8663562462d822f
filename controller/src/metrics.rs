//! The Controller Metrics snapshot and its two renderings: the JSON status
//! aggregate and the Prometheus text exposition.
//!
//! Matches the single-mutex, snapshot-copy-on-read discipline used
//! everywhere else process state is shared across tasks in this codebase.

use crate::config::Config;
use crate::crd::HealthCheckStatus;
use crate::labels::sanitize_label_value;
use kind::Kind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

const HISTOGRAM_BUCKETS: [f64; 7] = [1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

#[derive(Default)]
struct Inner {
    is_leader: bool,
    cluster_state_populated: bool,
    scheduler_loop_duration_seconds: f64,
    scheduler_due_checks: u64,
    reaper_last_sweep_duration_seconds: f64,
    reaper_deleted_pods_by_reason: HashMap<String, u64>,
    checks: HashMap<(String, String), CheckSnapshot>,
}

#[derive(Clone, Default, Serialize)]
pub struct CheckSnapshot {
    pub ok: bool,
    pub errors: Vec<String>,
    pub last_run_duration_seconds: f64,
    pub last_ok_unix: i64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub current_uuid: String,
    pub next_run_unix: i64,
    pub pod_name: String,
    pub timeout_seconds: u64,
    pub run_interval_seconds: u64,
    #[serde(skip)]
    extra_labels: BTreeMap<String, String>,
    #[serde(skip)]
    histogram_counts: [u64; HISTOGRAM_BUCKETS.len()],
    #[serde(skip)]
    histogram_sum: f64,
    #[serde(skip)]
    histogram_count: u64,
}

lazy_static! {
    static ref METRICS: Mutex<Inner> = Mutex::new(Inner::default());
}

pub fn set_leader(is_leader: bool) {
    METRICS.lock().unwrap().is_leader = is_leader;
}

pub fn set_cluster_state_populated(populated: bool) {
    METRICS.lock().unwrap().cluster_state_populated = populated;
}

pub fn record_scheduler_loop(duration_seconds: f64, due_checks: u64) {
    let mut inner = METRICS.lock().unwrap();
    inner.scheduler_loop_duration_seconds = duration_seconds;
    inner.scheduler_due_checks = due_checks;
}

pub fn record_reaper_sweep(duration_seconds: f64) {
    METRICS.lock().unwrap().reaper_last_sweep_duration_seconds = duration_seconds;
}

pub fn record_deleted_pod(reason: &str) {
    let mut inner = METRICS.lock().unwrap();
    *inner
        .reaper_deleted_pods_by_reason
        .entry(reason.to_string())
        .or_insert(0) += 1;
}

/// Rolls a completed run's result into both the per-check snapshot and the
/// run-duration histogram.
pub fn record_check_result(namespace: &str, name: &str, status: &HealthCheckStatus) {
    let mut inner = METRICS.lock().unwrap();
    let key = (namespace.to_string(), name.to_string());
    let snapshot = inner.checks.entry(key).or_default();
    snapshot.ok = status.ok;
    snapshot.errors = status.errors.clone();
    snapshot.last_run_duration_seconds = status.last_run_duration_seconds;
    snapshot.last_ok_unix = status.last_ok_unix;
    snapshot.success_count = status.success_count;
    snapshot.failure_count = status.failure_count;
    snapshot.consecutive_failures = status.consecutive_failures;
    snapshot.current_uuid = status.current_uuid.clone();

    snapshot.histogram_sum += status.last_run_duration_seconds;
    snapshot.histogram_count += 1;
    for (i, bucket) in HISTOGRAM_BUCKETS.iter().enumerate() {
        if status.last_run_duration_seconds <= *bucket {
            snapshot.histogram_counts[i] += 1;
        }
    }
}

pub fn record_scheduling(namespace: &str, name: &str, next_run_unix: i64, timeout_seconds: u64, run_interval_seconds: u64) {
    let mut inner = METRICS.lock().unwrap();
    let key = (namespace.to_string(), name.to_string());
    let snapshot = inner.checks.entry(key).or_default();
    snapshot.next_run_unix = next_run_unix;
    snapshot.timeout_seconds = timeout_seconds;
    snapshot.run_interval_seconds = run_interval_seconds;
}

/// Filters `extra_labels` through the configured allow/denylist and stores
/// the survivors for inclusion on the `kuberhealthy_check` gauge. An empty
/// allowlist means "allow anything not denied".
pub fn record_extra_labels(namespace: &str, name: &str, extra_labels: &BTreeMap<String, String>, config: &Config) {
    let mut inner = METRICS.lock().unwrap();
    let key = (namespace.to_string(), name.to_string());
    let filtered: BTreeMap<String, String> = extra_labels
        .iter()
        .filter(|(k, _)| !config.label_denylist.iter().any(|d| d == *k))
        .filter(|(k, _)| config.label_allowlist.is_empty() || config.label_allowlist.iter().any(|a| a == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    inner.checks.entry(key).or_default().extra_labels = filtered;
}

pub fn record_pod_name(namespace: &str, name: &str, pod_name: &str) {
    let mut inner = METRICS.lock().unwrap();
    let key = (namespace.to_string(), name.to_string());
    inner.checks.entry(key).or_default().pod_name = pod_name.to_string();
}

pub fn remove_check(namespace: &str, name: &str) {
    let mut inner = METRICS.lock().unwrap();
    inner.checks.remove(&(namespace.to_string(), name.to_string()));
}

#[derive(Serialize, Kind)]
pub struct StatusSnapshot {
    #[serde(rename = "OK")]
    pub ok: bool,
    #[serde(rename = "Errors")]
    pub errors: Vec<String>,
    #[serde(rename = "CheckDetails")]
    pub check_details: HashMap<String, CheckSnapshot>,
    #[serde(rename = "Controller")]
    pub controller: ControllerSnapshot,
}

#[derive(Serialize)]
pub struct ControllerSnapshot {
    pub is_leader: bool,
    pub scheduler_loop_duration_seconds: f64,
    pub scheduler_due_checks: u64,
    pub reaper_last_sweep_duration_seconds: f64,
    pub reaper_deleted_pods_total_by_reason: HashMap<String, u64>,
}

/// Renders the `GET /status` JSON aggregate. `OK` is the AND of every known
/// check; an empty registry is vacuously OK.
pub fn status_snapshot() -> StatusSnapshot {
    let inner = METRICS.lock().unwrap();
    let mut check_details = HashMap::new();
    let mut overall_ok = true;
    let mut overall_errors = Vec::new();
    for ((namespace, name), snapshot) in inner.checks.iter() {
        if !snapshot.ok {
            overall_ok = false;
            overall_errors.extend(snapshot.errors.iter().cloned());
        }
        check_details.insert(format!("{}/{}", namespace, name), snapshot.clone());
    }
    StatusSnapshot {
        ok: overall_ok,
        errors: overall_errors,
        check_details,
        controller: ControllerSnapshot {
            is_leader: inner.is_leader,
            scheduler_loop_duration_seconds: inner.scheduler_loop_duration_seconds,
            scheduler_due_checks: inner.scheduler_due_checks,
            reaper_last_sweep_duration_seconds: inner.reaper_last_sweep_duration_seconds,
            reaper_deleted_pods_total_by_reason: inner.reaper_deleted_pods_by_reason.clone(),
        },
    }
}

/// Renders the `GET /metrics` Prometheus text exposition per the fixed set
/// of metric names this controller publishes.
pub fn render_prometheus(config: &Config) -> String {
    let inner = METRICS.lock().unwrap();
    let mut out = String::new();

    push_gauge(&mut out, "kuberhealthy_cluster_state", if inner.cluster_state_populated { 1.0 } else { 0.0 }, "");
    push_gauge(&mut out, "kuberhealthy_controller_leader", if inner.is_leader { 1.0 } else { 0.0 }, "");
    push_gauge(&mut out, "kuberhealthy_scheduler_loop_duration_seconds", inner.scheduler_loop_duration_seconds, "");
    push_gauge(&mut out, "kuberhealthy_scheduler_due_checks", inner.scheduler_due_checks as f64, "");
    push_gauge(&mut out, "kuberhealthy_reaper_last_sweep_duration_seconds", inner.reaper_last_sweep_duration_seconds, "");

    for (reason, count) in inner.reaper_deleted_pods_by_reason.iter() {
        let reason = label(reason, config);
        out.push_str(&format!(
            "kuberhealthy_reaper_deleted_pods_total{{reason=\"{}\"}} {}\n",
            reason, count
        ));
    }

    let now_unix = chrono::Utc::now().timestamp();
    for ((namespace, name), snapshot) in inner.checks.iter() {
        let namespace = label(namespace, config);
        let name = label(name, config);
        let status = if snapshot.ok { "OK" } else { "error" };
        let mut check_labels = format!("check=\"{}\",namespace=\"{}\",status=\"{}\"", name, namespace, status);
        if !config.suppress_error_label && !snapshot.ok {
            if let Some(first) = snapshot.errors.first() {
                check_labels.push_str(&format!(",error=\"{}\"", label(first, config)));
            }
        }
        for (k, v) in snapshot.extra_labels.iter() {
            check_labels.push_str(&format!(",{}=\"{}\"", k, label(v, config)));
        }
        out.push_str(&format!(
            "kuberhealthy_check{{{}}} {}\n",
            check_labels,
            if snapshot.ok { 1 } else { 0 }
        ));

        let base_labels = format!("check=\"{}\",namespace=\"{}\"", name, namespace);
        out.push_str(&format!(
            "kuberhealthy_check_duration_seconds{{{}}} {}\n",
            base_labels, snapshot.last_run_duration_seconds
        ));
        out.push_str(&format!(
            "kuberhealthy_check_consecutive_failures{{{}}} {}\n",
            base_labels, snapshot.consecutive_failures
        ));
        out.push_str(&format!(
            "kuberhealthy_check_success_total{{{}}} {}\n",
            base_labels, snapshot.success_count
        ));
        out.push_str(&format!(
            "kuberhealthy_check_failure_total{{{}}} {}\n",
            base_labels, snapshot.failure_count
        ));
        let seconds_since_success = if snapshot.last_ok_unix == 0 {
            -1.0
        } else {
            (now_unix - snapshot.last_ok_unix) as f64
        };
        out.push_str(&format!(
            "kuberhealthy_check_seconds_since_success{{{}}} {}\n",
            base_labels, seconds_since_success
        ));

        let mut cumulative = 0u64;
        for (i, bucket) in HISTOGRAM_BUCKETS.iter().enumerate() {
            cumulative += snapshot.histogram_counts[i];
            out.push_str(&format!(
                "kuberhealthy_check_run_duration_seconds_bucket{{{},le=\"{}\"}} {}\n",
                base_labels, bucket, cumulative
            ));
        }
        out.push_str(&format!(
            "kuberhealthy_check_run_duration_seconds_bucket{{{},le=\"+Inf\"}} {}\n",
            base_labels, snapshot.histogram_count
        ));
        out.push_str(&format!(
            "kuberhealthy_check_run_duration_seconds_sum{{{}}} {}\n",
            base_labels, snapshot.histogram_sum
        ));
        out.push_str(&format!(
            "kuberhealthy_check_run_duration_seconds_count{{{}}} {}\n",
            base_labels, snapshot.histogram_count
        ));
    }

    out
}

fn push_gauge(out: &mut String, name: &str, value: f64, _labels: &str) {
    out.push_str(&format!("{} {}\n", name, value));
}

fn label(value: &str, config: &Config) -> String {
    sanitize_label_value(value, config.label_max_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HealthCheckStatus;

    fn reset() {
        let mut inner = METRICS.lock().unwrap();
        *inner = Inner::default();
    }

    #[test]
    fn cluster_state_reflects_populated_flag() {
        reset();
        set_cluster_state_populated(true);
        let config = Config::from_env();
        let rendered = render_prometheus(&config);
        assert!(rendered.contains("kuberhealthy_cluster_state 1"));
    }

    #[test]
    fn seconds_since_success_is_negative_one_when_never_ok() {
        reset();
        let status = HealthCheckStatus::default();
        record_check_result("kh", "demo", &status);
        let config = Config::from_env();
        let rendered = render_prometheus(&config);
        assert!(rendered.contains("kuberhealthy_check_seconds_since_success{check=\"demo\",namespace=\"kh\"} -1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        reset();
        let mut status = HealthCheckStatus::default();
        status.last_run_duration_seconds = 7.0;
        record_check_result("kh", "demo", &status);
        let config = Config::from_env();
        let rendered = render_prometheus(&config);
        assert!(rendered.contains("le=\"1\"} 0"));
        assert!(rendered.contains("le=\"10\"} 1"));
        assert!(rendered.contains("le=\"+Inf\"} 1"));
    }

    #[test]
    fn status_snapshot_is_ok_when_empty() {
        reset();
        let snapshot = status_snapshot();
        assert!(snapshot.ok);
    }

    #[test]
    fn extra_labels_are_denied_when_listed() {
        reset();
        let mut config = Config::from_env();
        config.label_denylist = vec!["team".to_string()];
        let mut extra = BTreeMap::new();
        extra.insert("team".to_string(), "platform".to_string());
        extra.insert("region".to_string(), "us-east".to_string());
        record_extra_labels("kh", "demo", &extra, &config);
        let rendered = render_prometheus(&config);
        assert!(!rendered.contains("team=\"platform\""));
        assert!(rendered.contains("region=\"us-east\""));
    }

    #[test]
    fn extra_labels_allowlist_is_exclusive_when_set() {
        reset();
        let mut config = Config::from_env();
        config.label_allowlist = vec!["region".to_string()];
        let mut extra = BTreeMap::new();
        extra.insert("team".to_string(), "platform".to_string());
        extra.insert("region".to_string(), "us-east".to_string());
        record_extra_labels("kh", "demo", &extra, &config);
        let rendered = render_prometheus(&config);
        assert!(!rendered.contains("team=\"platform\""));
        assert!(rendered.contains("region=\"us-east\""));
    }
}
