//! Error types shared across the reset job.

/// Errors raised while configuring, scheduling, or running the daily reset.
#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Invalid date key: {0}")]
    InvalidDateKey(String),
}

pub type ResetResult<T> = Result<T, ResetError>;

