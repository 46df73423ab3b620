//! Scheduler entry point.
//!
//! Loads configuration, connects the store, and keeps the daily reset job
//! running until interrupted.

use std::sync::Arc;

use roster_reset::config::get_config;
use roster_reset::jobs::{DailyResetCoordinator, JobScheduler};
use roster_reset::logging::init_logging;
use roster_reset::store::SqlStore;
use roster_reset::ResetResult;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("roster_reset: {e}");
        std::process::exit(1);
    }
}

async fn run() -> ResetResult<()> {
    let config = get_config()?;
    init_logging(&config.logging)?;

    let store = Arc::new(SqlStore::connect(&config.database).await?);
    store.ensure_schema().await?;

    let coordinator = DailyResetCoordinator::from_config(store.clone(), config);
    let mut scheduler = JobScheduler::new(coordinator, config.schedule.clone()).await?;
    scheduler.start().await?;

    tracing::info!("Waiting for the next reset; press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }

    scheduler.shutdown().await?;
    store.close().await;
    Ok(())
}
