//! Worker entry point: configuration, logging, liveness, supervision,
//! and ordered shutdown on SIGTERM / SIGINT.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wa_worker::worker::config::WorkerConfig;
use wa_worker::worker::edge::EdgeClient;
use wa_worker::worker::health;
use wa_worker::worker::locks::LockCoordinator;
use wa_worker::worker::manager::InstanceManager;
use wa_worker::worker::transport::{WaWebConfig, WaWebTransport};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Fatal errors anywhere in the supervisor must not leave a half-dead
    // process behind.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        error!("fatal error, exiting");
        std::process::exit(1);
    }));

    let cfg = match WorkerConfig::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(1);
        }
    };

    let edge = match EdgeClient::new(&cfg) {
        Ok(edge) => Arc::new(edge),
        Err(e) => {
            error!(error = %e, "edge client init failed");
            std::process::exit(1);
        }
    };

    let owner = WorkerConfig::owner_id();
    info!(owner = %owner, edge = %cfg.edge_base_url, "worker starting");

    let health_task = health::spawn(cfg.port);

    let transport = Arc::new(WaWebTransport::new(WaWebConfig::from_env()));
    let (locks, lock_lost) = LockCoordinator::new(
        Arc::clone(&edge),
        owner,
        cfg.lock_ttl,
        cfg.lock_renew,
    );
    let manager = InstanceManager::new(Arc::clone(&cfg), edge, transport, locks);
    manager.start(lock_lost);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    manager.shutdown().await;
    health_task.abort();
    info!("worker exited");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
