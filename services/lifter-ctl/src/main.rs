//! lifter-ctl
//!
//! Keeps the kernel service table in step with live endpoint membership.
//!
//! ## Startup
//!
//! 1. Open the service table and subscribe to the endpoint feed
//! 2. Resync: repair drift between the table and a full snapshot
//! 3. Start shard workers and the sync driver
//! 4. Serve `/metrics` and `/healthz` when configured
//!
//! Startup failures exit non-zero. After that the process runs until
//! interrupted; per-service failures are retried, never fatal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lifter_ctl::api::{self, ApiState};
use lifter_ctl::{Config, HttpEventSource, HttpSourceConfig, MetricsExporter, SqliteTable};
use lifter_reconcile::{Engine, EventSource, ServiceTable};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        source_url = %config.source_url,
        table_path = %config.table_path.display(),
        table_capacity = config.table_capacity,
        workers = config.engine.workers,
        "Starting lifter-ctl"
    );

    if let Some(parent) = config.table_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let table = SqliteTable::open(&config.table_path, config.table_capacity)
        .with_context(|| format!("Failed to open service table {}", config.table_path.display()))?;
    let table: Arc<dyn ServiceTable> = Arc::new(table);

    let source = HttpEventSource::new(HttpSourceConfig {
        poll_interval: config.poll_interval,
        fetch_limit: config.fetch_limit,
        redeliver_interval: config.engine.resync_interval,
        ..HttpSourceConfig::new(config.source_url.clone())
    })?;
    let source: Arc<dyn EventSource> = Arc::new(source);

    let engine = Engine::start(table, source, config.engine.clone())
        .await
        .context("Startup resync failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = match config.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind metrics address {addr}"))?;
            let state = ApiState {
                metrics: Arc::clone(engine.metrics()),
                shadow: Arc::clone(engine.shadow()),
                pool: engine.handle(),
                exporter: Arc::new(MetricsExporter::new()),
                table_capacity: config.table_capacity,
            };
            Some(tokio::spawn(api::serve(listener, state, shutdown_rx)))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    engine.shutdown(Duration::from_secs(10)).await;

    if let Some(handle) = server_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server error"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }
    }

    info!("lifter-ctl shutdown complete");
    Ok(())
}
