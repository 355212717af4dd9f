//! webcron scheduler daemon.
//!
//! Boots the scheduler core against the configured store and runs until
//! interrupted. Configuration comes from `WEBCRON_*` environment variables;
//! log filtering follows `RUST_LOG`.

use tracing::info;
use tracing_subscriber::EnvFilter;

use webcron_runtime::{RuntimeConfig, SchedulerRuntime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RuntimeConfig::from_env()?;
    info!(db = %config.database_path.display(), "starting webcron scheduler");

    let runtime = SchedulerRuntime::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    runtime.shutdown().await;
    Ok(())
}
