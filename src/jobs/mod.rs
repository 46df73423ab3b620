//! The daily roster reset job.
//!
//! - **Coordinator** (`daily_reset`): computes today's date key in the reset
//!   timezone and claims the day on the control record. Only the claiming run
//!   fans out over the groups.
//! - **Resetter** (`roster_reset`): clears every roster entry of one group in
//!   atomic batches and stamps the group's `lastResetAt`.
//! - **Scheduler** (requires the `background-jobs` feature): fires the
//!   coordinator at midnight in the reset timezone.
//!
//! # Usage
//!
//! ```rust,ignore
//! use roster_reset::config::get_config;
//! use roster_reset::jobs::{DailyResetCoordinator, JobScheduler};
//! use roster_reset::store::SqlStore;
//!
//! let config = get_config()?;
//! let store = Arc::new(SqlStore::connect(&config.database).await?);
//! let coordinator = DailyResetCoordinator::from_config(store, config);
//! let scheduler = JobScheduler::new(coordinator, config.schedule.clone()).await?;
//! scheduler.start().await?;
//! ```

mod daily_reset;
mod roster_reset;

pub use daily_reset::{DailyResetCoordinator, FanOutReport, GroupFailure, ResetOutcome};
pub use roster_reset::{GroupResetSummary, RosterResetter};

#[cfg(feature = "background-jobs")]
pub use scheduler::JobScheduler;

#[cfg(feature = "background-jobs")]
mod scheduler {
    use chrono::Local;
    use std::sync::Arc;
    use tokio_cron_scheduler::{Job, JobScheduler as TokioJobScheduler};
    use tracing::{error, info, warn};

    use super::{DailyResetCoordinator, ResetOutcome};
    use crate::config::ScheduleConfig;
    use crate::errors::{ResetError, ResetResult};

    fn scheduler_err(e: impl std::fmt::Display) -> ResetError {
        ResetError::SchedulerError(e.to_string())
    }

    /// Cron scheduler driving the daily reset.
    pub struct JobScheduler {
        scheduler: TokioJobScheduler,
        coordinator: Arc<DailyResetCoordinator>,
        config: ScheduleConfig,
    }

    impl JobScheduler {
        /// Create a new job scheduler.
        pub async fn new(
            coordinator: DailyResetCoordinator,
            config: ScheduleConfig,
        ) -> ResetResult<Self> {
            let scheduler = TokioJobScheduler::new().await.map_err(scheduler_err)?;

            Ok(Self {
                scheduler,
                coordinator: Arc::new(coordinator),
                config,
            })
        }

        /// Register the reset job (unless disabled) and start ticking.
        pub async fn start(&self) -> ResetResult<()> {
            info!("Starting roster reset scheduler");

            if self.config.enabled {
                self.add_daily_reset_job().await?;
            } else {
                warn!("Daily roster reset job is disabled by configuration");
            }

            self.scheduler.start().await.map_err(scheduler_err)?;

            info!("Roster reset scheduler started successfully");

            Ok(())
        }

        /// Stop the job scheduler.
        pub async fn shutdown(&mut self) -> ResetResult<()> {
            info!("Shutting down roster reset scheduler");
            self.scheduler.shutdown().await.map_err(scheduler_err)?;
            Ok(())
        }

        /// Add the midnight reset job, bound to the reset timezone.
        ///
        /// An unresolvable timezone binds the job to the host's local zone,
        /// matching the date-key fallback.
        async fn add_daily_reset_job(&self) -> ResetResult<()> {
            let coordinator = Arc::clone(&self.coordinator);
            let cron = self.config.cron.as_str();

            let run = move |_uuid: uuid::Uuid, _l: TokioJobScheduler| {
                let coordinator = Arc::clone(&coordinator);
                Box::pin(async move {
                    run_and_log(&coordinator).await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            };

            let job = match self.coordinator.calendar().timezone() {
                Some(tz) => Job::new_async_tz(cron, tz, run),
                None => Job::new_async_tz(cron, Local, run),
            }
            .map_err(scheduler_err)?;

            self.scheduler.add(job).await.map_err(scheduler_err)?;

            info!(
                "Added daily roster reset job (schedule: {}, timezone: {})",
                self.config.cron,
                self.coordinator.calendar().timezone_name()
            );

            Ok(())
        }

        /// Run the reset immediately (useful for testing or manual triggers).
        pub async fn run_daily_reset_now(&self) -> ResetResult<ResetOutcome> {
            self.coordinator.ensure_daily_reset().await
        }
    }

    async fn run_and_log(coordinator: &DailyResetCoordinator) {
        match coordinator.ensure_daily_reset().await {
            Ok(ResetOutcome::Reset { date_key, report }) => {
                if report.is_complete() {
                    info!(
                        "Daily roster reset for {}: {} groups cleared",
                        date_key, report.groups_reset
                    );
                } else {
                    error!(
                        "Daily roster reset for {}: {} groups cleared, {} failed",
                        date_key,
                        report.groups_reset,
                        report.failures.len()
                    );
                }
            }
            Ok(ResetOutcome::AlreadyReset { date_key, .. }) => {
                info!("Daily roster reset for {} already done", date_key);
            }
            Err(e) => {
                error!("Daily roster reset failed: {}", e);
            }
        }
    }

}
