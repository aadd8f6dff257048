//! Ledger engine server binary
//!
//! Usage: `ledger-server [config.toml]`. Without a file, configuration is
//! read from `LEDGER_*` environment variables.

use anyhow::Context;
use ledger_engine::{Config, LedgerEngine};
use std::sync::Arc;
use tokio::sync::watch;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LEDGER_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting ledger engine server");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    let engine = Arc::new(
        LedgerEngine::open(config)
            .await
            .context("opening ledger engine")?,
    );
    tracing::info!(
        last_applied = engine.last_applied(),
        accounts = engine.ledger().account_count(),
        "Ledger engine opened"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = engine.reconciler();
    let reconciler_task = tokio::spawn(async move { reconciler.run(stop_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("Shutting down ledger engine server");
    let _ = stop_tx.send(true);
    let _ = reconciler_task.await;
    engine.shutdown().await.context("shutting down ledger engine")?;

    Ok(())
}
