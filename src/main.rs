//! Arrakis Orchestrator
//!
//! Runs a Discord shard fleet behind session admission control:
//! - Discovers the recommended shard layout and session concurrency
//! - Admits one identify per concurrency bucket per interval
//! - Exposes health/ready/shards endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::{bail, Result};
use arrakis_orchestrator::health::{self, AppState};
use arrakis_orchestrator::shard::{default_intents, ShardEvent, TwilightSessionBuilder};
use arrakis_orchestrator::{metrics, OrchestratorConfig, ShardManager};
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Buffered gateway events before sessions start dropping them
const EVENT_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = OrchestratorConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_orchestrator={}", config.log_level).parse()?)
                .add_directive("twilight_gateway=info".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_total = ?config.shard_total,
        shard_ids = ?config.shard_ids,
        "Starting Arrakis Orchestrator"
    );

    let prometheus = match metrics::install() {
        Ok(handle) => {
            info!("Prometheus metrics initialized");
            Some(handle)
        }
        Err(e) => {
            error!(error = %e, "Failed to install Prometheus recorder - metrics disabled");
            None
        }
    };

    let intents = default_intents();
    info!(?intents, "Using Discord intents");

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(drain_events(events_rx));

    let shutdown_hook = config.shutdown_hook;
    let http_port = config.http_port;
    let builder = TwilightSessionBuilder::new(config.token.clone(), intents, events_tx);
    let manager = ShardManager::with_http(config, builder)?;

    let app_state = AppState::new(manager.state(), prometheus);
    let addr: SocketAddr = ([0, 0, 0, 0], http_port).into();
    info!(port = http_port, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let http_server = axum::serve(listener, health::router(app_state.clone()));

    manager.login().await?;
    if let Some(total) = manager.shards_total() {
        app_state.set_shards_total(total);
    }
    info!(
        shards_total = manager.shards_total(),
        pending = manager.pending().len(),
        "Shard fleet logged in"
    );

    let mut fleet_failed = false;
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal(shutdown_hook) => {
            info!("Shutdown signal received");
        }
        _ = manager.stopped() => {
            error!("Shard manager stopped on its own");
            fleet_failed = true;
        }
    }

    info!("Shutting down orchestrator...");
    manager.shutdown().await;
    manager.await_termination().await;

    if fleet_failed {
        bail!("shard fleet shut down after a fatal error");
    }
    info!("Orchestrator shutdown complete");
    Ok(())
}

/// Consume gateway events. Downstream routing is not part of this process.
async fn drain_events(mut events: mpsc::Receiver<ShardEvent>) {
    while let Some(ShardEvent { shard_id, event }) = events.recv().await {
        debug!(shard_id, kind = ?event.kind(), "Gateway event");
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT). Never resolves when the
/// hook is disabled.
async fn shutdown_signal(enabled: bool) {
    if !enabled {
        std::future::pending::<()>().await;
    }

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
