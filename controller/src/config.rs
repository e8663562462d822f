//! Process-wide configuration, read once at startup from the environment.
//!
//! Mirrors the `std::env::var(...).unwrap_or(...)` idiom used throughout this
//! codebase rather than introducing a config-file parser: every knob here has
//! a sane default and can be overridden by an operator via a Deployment's
//! env block.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies this controller instance in pod labels and owner metadata.
    /// Distinct controller IDs can safely share a cluster.
    pub controller_id: String,

    /// When `Some`, the Watcher/Registry/Reaper are scoped to this single
    /// namespace. When `None`, they operate cluster-wide.
    pub namespace: Option<String>,

    /// How often the Reaper sweeps for orphaned pods.
    pub reaper_sweep_interval: Duration,

    /// Extra grace period added on top of a check's timeout before the
    /// Reaper considers a still-running pod deadline-exceeded.
    pub reaper_grace_period: Duration,

    /// Name of the cluster-wide `Lease` object used for leader election.
    pub lease_name: String,
    /// Namespace the `Lease` object lives in.
    pub lease_namespace: String,
    /// How long a held lease remains valid without renewal.
    pub lease_duration: Duration,
    /// How often the leader renews its lease.
    pub lease_renew_interval: Duration,

    /// Address the ingest/status/metrics HTTP surface binds to.
    pub bind_address: String,
    /// Port the ingest/status/metrics HTTP surface binds to.
    pub bind_port: u16,

    /// Base URL injected as `KH_REPORTING_URL` into every checker pod; the
    /// ingest path is appended by the runner.
    pub reporting_base_url: String,

    /// Optional allowlist for extra metric labels. Empty means "allow all
    /// unless denied".
    pub label_allowlist: Vec<String>,
    /// Labels never forwarded onto the metrics surface.
    pub label_denylist: Vec<String>,
    /// Labels and values longer than this are truncated before export.
    pub label_max_length: usize,
    /// When true, the `error` label is omitted from `kuberhealthy_check`.
    pub suppress_error_label: bool,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            controller_id: env_string("KH_CONTROLLER_ID", "healthcheck-controller"),
            namespace: std::env::var("KH_NAMESPACE").ok().filter(|s| !s.is_empty()),
            reaper_sweep_interval: env_duration_secs("KH_REAPER_SWEEP_INTERVAL_SECONDS", 60),
            reaper_grace_period: env_duration_secs("KH_REAPER_GRACE_PERIOD_SECONDS", 5),
            lease_name: env_string("KH_LEASE_NAME", "healthcheck-controller-leader"),
            lease_namespace: env_string("KH_LEASE_NAMESPACE", "kuberhealthy"),
            lease_duration: env_duration_secs("KH_LEASE_DURATION_SECONDS", 15),
            lease_renew_interval: env_duration_secs("KH_LEASE_RENEW_INTERVAL_SECONDS", 5),
            bind_address: env_string("KH_BIND_ADDRESS", "0.0.0.0"),
            bind_port: env_string("KH_BIND_PORT", "8080")
                .parse()
                .unwrap_or(8080),
            reporting_base_url: env_string("KH_REPORTING_BASE_URL", "http://kuberhealthy.kuberhealthy"),
            label_allowlist: env_list("KH_METRIC_LABEL_ALLOWLIST"),
            label_denylist: env_list("KH_METRIC_LABEL_DENYLIST"),
            label_max_length: env_string("KH_METRIC_LABEL_MAX_LENGTH", "256")
                .parse()
                .unwrap_or(256),
            suppress_error_label: env_string("KH_SUPPRESS_ERROR_LABEL", "false")
                .parse()
                .unwrap_or(false),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("KH_TEST_LIST", "a, b ,c");
        assert_eq!(env_list("KH_TEST_LIST"), vec!["a", "b", "c"]);
        std::env::remove_var("KH_TEST_LIST");
    }

    #[test]
    fn env_list_missing_is_empty() {
        std::env::remove_var("KH_TEST_LIST_MISSING");
        assert!(env_list("KH_TEST_LIST_MISSING").is_empty());
    }
}
