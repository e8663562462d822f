extern crate jemallocator;

// jemalloc keeps long-running idle periods cheap; this controller spends
// most of its life parked on timers and watch streams between bursts of
// pod churn, and glibc's allocator fragments badly under that pattern.
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[macro_use]
extern crate rocket;

#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod crd;
pub mod ingest;
pub mod labels;
pub mod leader;
pub mod metrics;
pub mod pod_template;
pub mod reaper;
pub mod registry;
pub mod runner;
pub mod status;
pub mod watcher;

use config::Config;
use leader::LeadershipEvent;
use term_colors::*;
use tokio::sync::{mpsc, oneshot};

#[tokio::main]
async fn main() {
    std::env::set_var("RUST_LOG_STYLE", "always");
    env_logger::init();

    let config = Config::from_env();
    info!(
        "starting {} (namespace scope: {})",
        cyan(&config.controller_id),
        config
            .namespace
            .as_deref()
            .map(|ns| cyan(ns).to_string())
            .unwrap_or_else(|| "cluster-wide".to_string())
    );

    let (leadership_tx, leadership_rx) = mpsc::channel(4);
    let (leader_shutdown_tx, leader_shutdown_rx) = oneshot::channel();

    let leader_task = tokio::spawn(leader::run(config.clone(), leadership_tx, leader_shutdown_rx));
    let scope_task = tokio::spawn(drive_leadership_scopes(config.clone(), leadership_rx));

    let mut rocket_config = rocket::Config::default();
    rocket_config.address = config
        .bind_address
        .parse()
        .expect("KH_BIND_ADDRESS must be a valid IP address");
    rocket_config.port = config.bind_port;

    let rocket = rocket::custom(rocket_config)
        .manage(config.clone())
        .mount("/", routes![status::status_root, status::status, status::prometheus])
        .mount("/", routes![ingest::check]);

    let server = tokio::spawn(rocket.launch());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = leader_shutdown_tx.send(());
    let _ = leader_task.await;
    let _ = scope_task.await;
    server.abort();
}

/// Owns the lifetime of the Watcher and Reaper, starting them when this
/// replica acquires leadership and cancelling them the moment it loses it
/// (or on process shutdown, which the Leader Gate surfaces as a final
/// `Lost` event). No Runner is ever started outside of this scope, which is
/// what guarantees non-leaders create no pods.
async fn drive_leadership_scopes(config: Config, mut events: mpsc::Receiver<LeadershipEvent>) {
    type ScopeHandles = (
        oneshot::Sender<()>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<()>,
        tokio::task::JoinHandle<()>,
    );
    let mut active: Option<ScopeHandles> = None;

    while let Some(event) = events.recv().await {
        match event {
            LeadershipEvent::Acquired => {
                if active.is_some() {
                    continue;
                }
                info!("leadership acquired, starting watcher and reaper");
                let (watcher_stop_tx, watcher_stop_rx) = oneshot::channel();
                let (reaper_stop_tx, reaper_stop_rx) = oneshot::channel();
                let watcher_handle = tokio::spawn(watcher::run(config.clone(), watcher_stop_rx));
                let reaper_handle = tokio::spawn(reaper::run(config.clone(), reaper_stop_rx));
                active = Some((watcher_stop_tx, reaper_stop_tx, watcher_handle, reaper_handle));
            }
            LeadershipEvent::Lost => {
                if let Some((watcher_stop, reaper_stop, watcher_handle, reaper_handle)) = active.take() {
                    warn!("leadership lost, draining watcher and reaper");
                    let _ = watcher_stop.send(());
                    let _ = reaper_stop.send(());
                    let _ = watcher_handle.await;
                    let _ = reaper_handle.await;
                    registry::stop_all().await;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {},
        _ = int.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
