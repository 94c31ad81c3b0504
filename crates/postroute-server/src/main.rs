//! PostRoute - mail processing server entry point

use anyhow::Result;
use postroute_common::config::Config;
use postroute_core::{CapabilityRegistry, SpoolDispatcher};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so logging honors it
    let config = Config::load()?;
    init_logging(&config);

    info!("Starting PostRoute on {}...", config.server.hostname);

    // Assemble the pipeline
    let registry = CapabilityRegistry::with_builtins();
    let router = Arc::new(registry.build_router(&config.pipeline)?);
    info!(
        processors = config.pipeline.processors.len(),
        "pipeline assembled"
    );

    // Start spool workers
    let dispatcher = SpoolDispatcher::start(
        router,
        config.spool.workers,
        config.spool.queue_size,
    );
    info!(
        workers = config.spool.workers,
        queue_size = config.spool.queue_size,
        "spool dispatcher started"
    );

    info!("PostRoute started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Drain what was already accepted
    dispatcher.shutdown().await;

    info!("PostRoute shutdown complete");

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},postroute=debug", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
