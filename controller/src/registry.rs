//! The Check Registry: an in-memory, single-writer map from `(namespace,
//! name)` to a running check's handle, plus a reverse index from run UUID to
//! key so the ingest endpoint can route a report without knowing which check
//! it belongs to.
//!
//! Mirrors the shape of a process-global, lazily-initialized cache guarded by
//! a single lock, the same pattern this codebase already uses for tracking
//! long-running per-entity daemons.

use crate::crd::HealthCheck;
use crate::runner::{self, IngestOutcome, IngestReport, RunnerHandle};
use result::Result;
use std::collections::HashMap;
use term_colors::*;
use tokio::sync::RwLock;

pub type CheckKey = (String, String);

lazy_static! {
    static ref CHECKS: RwLock<HashMap<CheckKey, RunnerHandle>> = RwLock::new(HashMap::new());
    static ref UUID_INDEX: RwLock<HashMap<String, CheckKey>> = RwLock::new(HashMap::new());
}

fn key_of(check: &HealthCheck) -> CheckKey {
    (
        check.metadata.namespace.clone().unwrap_or_default(),
        check.metadata.name.clone().unwrap_or_default(),
    )
}

/// Starts a Runner for `check` and registers its handle. Per the registry's
/// single-writer contract this must only ever be called from the Watcher.
pub async fn start(check: HealthCheck) {
    let key = key_of(&check);
    info!("starting check runner for {}/{}", cyan(&key.0), cyan(&key.1));
    let handle = runner::spawn(check);
    CHECKS.write().await.insert(key, handle);
}

/// Cancels the Runner for `key` and blocks until its teardown has completed
/// (outstanding pod deleted, `currentUUID` cleared). A no-op if the key is
/// not registered.
pub async fn stop(key: &CheckKey) {
    let handle = CHECKS.write().await.remove(key);
    if let Some(handle) = handle {
        handle.stop().await;
        unindex_uuid(key).await;
    }
}

/// `update` is `stop(old); start(new)` exactly as specified: the in-flight
/// run, if any, is fully drained before the new spec is ever scheduled.
pub async fn update(old_key: &CheckKey, new: HealthCheck) {
    stop(old_key).await;
    start(new).await;
}

/// Looks up the Runner owning `uuid` so the ingest endpoint can hand it a
/// report without needing to know the check's identity up front. Returns
/// `None` when the UUID is unknown or stale.
pub async fn lookup_for_ingest(uuid: &str) -> Option<RunnerHandle> {
    let key = UUID_INDEX.read().await.get(uuid).cloned()?;
    CHECKS.read().await.get(&key).cloned()
}

/// Called by a Runner immediately after writing `currentUUID` at Launching,
/// so ingest lookups become possible the moment a run is authorized.
pub async fn index_uuid(key: CheckKey, uuid: String) {
    UUID_INDEX.write().await.insert(uuid, key);
}

/// Called by a Runner once a run settles (Reporting, TimedOut, or Cancelling)
/// so a stale UUID can never again be routed to a report handler.
pub async fn deindex_uuid(uuid: &str) {
    UUID_INDEX.write().await.remove(uuid);
}

async fn unindex_uuid(key: &CheckKey) {
    let mut index = UUID_INDEX.write().await;
    index.retain(|_, v| v != key);
}

/// Routes an ingested report to the owning Runner. Returns
/// `IngestOutcome::UnknownOrStaleUuid` when no Runner currently authorizes
/// `uuid` — this is the only rejection path ingest needs, per the contract
/// that a report is accepted iff it matches the check's current UUID.
pub async fn submit_report(uuid: &str, report: IngestReport) -> Result<IngestOutcome> {
    match lookup_for_ingest(uuid).await {
        Some(handle) => handle.report(uuid.to_string(), report).await,
        None => Ok(IngestOutcome::UnknownOrStaleUuid),
    }
}

/// Snapshots every currently-registered key, used by the Reaper to decide
/// whether a pod's `check` label still corresponds to a live HealthCheck.
pub async fn registered_keys() -> Vec<CheckKey> {
    CHECKS.read().await.keys().cloned().collect()
}

/// Snapshots the currently-active UUID for `key`, if any, used by the Reaper
/// to decide whether a pod's `uuid` label is stale.
pub async fn active_uuid(key: &CheckKey) -> Option<String> {
    let handle = CHECKS.read().await.get(key).cloned()?;
    handle.active_uuid().await
}

/// Tears down every registered Runner. Used when the Leader Gate drains on
/// lease loss or process shutdown.
pub async fn stop_all() {
    let keys: Vec<CheckKey> = registered_keys().await;
    for key in keys {
        stop(&key).await;
    }
}
