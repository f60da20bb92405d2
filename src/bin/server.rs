//! HTTP server for the conversion pipeline.

use anyhow::{Context, Result};
use sqlly::config::Config;
use sqlly::observability::init_tracing;
use sqlly::orchestrator::Orchestrator;
use sqlly::server::serve;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // Missing variables fail here, before any network call.
    let config = Config::from_env().context("Failed to load configuration")?;
    let orchestrator = Orchestrator::from_config(&config)?;

    info!(
        agent = %config.agent.agent_name,
        max_attempts = config.agent.retry.max_attempts,
        "Starting sqlly server on {}",
        config.bind_addr
    );
    serve(orchestrator, &config.bind_addr).await?;
    Ok(())
}
