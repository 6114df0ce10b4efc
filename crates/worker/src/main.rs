use std::sync::Arc;

use anyhow::{Context, Result};
use switchyard_dispatch::telemetry::{init_logging, LoggingConfig};
use switchyard_dispatch::unit::serve_stdio;
use switchyard_worker::ReferenceHandler;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("switchyard-worker: {e:#}");
            1
        }
    };
    // The stdin reader parks a blocking thread; leave without waiting on it.
    std::process::exit(code);
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries the pool channel, so logs go to stderr without colour.
    init_logging(LoggingConfig::for_worker_process()).context("Failed to initialise logging")?;

    tracing::info!(pid = std::process::id(), "switchyard-worker starting...");
    serve_stdio(Arc::new(ReferenceHandler::new()))
        .await
        .context("Worker stopped with an error")?;

    tracing::info!("switchyard-worker shutdown complete");
    Ok(())
}
