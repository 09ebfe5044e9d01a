//! gamefleet operator
//!
//! Runs the fleet and instance controllers against the object store until
//! interrupted.

use std::sync::Arc;

use anyhow::Result;
use gamefleet_operator::config::{self, Config};
use gamefleet_operator::events::TracingRecorder;
use gamefleet_operator::telemetry::CountingTelemetry;
use gamefleet_operator::{MemoryStore, Operator};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        min_port = config.min_port,
        max_port = config.max_port,
        concurrency = config.concurrency,
        resync_interval_secs = config.resync_interval.as_secs(),
        "Starting gamefleet operator"
    );

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.fleets_file {
        let fleets = config::load_fleets(path)?;
        info!(path = %path.display(), count = fleets.len(), "Loaded fleets");
        for fleet in fleets {
            store.apply_fleet(fleet);
        }
    }

    let operator = Operator::new(
        &config,
        store,
        Arc::new(TracingRecorder),
        Arc::new(CountingTelemetry::new()),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let operator_handle = tokio::spawn(async move { operator.run(shutdown_rx).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = operator_handle.await {
        error!(error = %e, "Operator task failed");
    }

    info!("Operator shutdown complete");
    Ok(())
}
