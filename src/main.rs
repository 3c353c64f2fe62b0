//! is-server-down - HTTP uptime monitor
//!
//! Probes a fixed set of endpoints on a schedule, keeps the outcomes in a
//! time-series log and serves a per-target status summary for dashboards.

mod config;
mod db;
mod probe;
mod scheduler;
mod status;
mod web;

use config::ServerConfig;
use db::Store;
use probe::ProbeTarget;
use scheduler::{RetentionManager, Scheduler};
use status::{Aggregator, ResultCache};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("is_server_down=info".parse()?))
        .init();

    // Load configuration; anything missing is fatal
    let cfg = match ServerConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let targets = cfg
        .targets
        .iter()
        .map(|t| ProbeTarget::from_config(t, cfg.probe_timeout))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|e| {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        });

    tracing::info!("Starting is-server-down on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Start probing
    let scheduler = Scheduler::new(
        store.clone(),
        targets,
        cfg.poll_interval,
        cfg.max_concurrent_probes,
    )?;
    scheduler.start();

    let retention = RetentionManager::new(store.clone(), cfg.retention, cfg.retention_sweep);
    retention.start();

    // Read side
    let aggregator = Arc::new(Aggregator::new(store.clone(), cfg.history_size));
    let status = Arc::new(ResultCache::new(aggregator, cfg.cache_ttl));

    // Start web server
    let server = Server::new(cfg.http_port, cfg.allowed_origins.clone(), store, status);
    server.start(shutdown_signal()).await?;

    scheduler.stop();
    retention.stop();

    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    wait_for_signal(tokio::signal::ctrl_c()).await
}

async fn wait_for_signal<F>(signal: F)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => tracing::info!("Shutting down"),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl-C, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_error_keeps_server_running() {
        let failed = async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "no signal handler")) };
        let waited = tokio::time::timeout(Duration::from_millis(100), wait_for_signal(failed)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_signal_received_shuts_down() {
        let received = async { Ok::<(), io::Error>(()) };
        let waited = tokio::time::timeout(Duration::from_millis(100), wait_for_signal(received)).await;
        assert!(waited.is_ok());
    }
}
