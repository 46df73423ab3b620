//! Structured logging for the reset job.
//!
//! Each coordinator run gets its own span carrying a unique run id and the
//! date key, so every event of one run can be correlated in the logs.

use std::str::FromStr;
use tracing::{error, info, info_span, Level, Span};
use uuid::Uuid;

use crate::calendar::DateKey;
use crate::config::LoggingConfig;
use crate::errors::{ResetError, ResetResult};

/// Reset lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    /// This run advanced the control record and owns today's reset
    Claimed,
    /// Today's reset was already recorded
    Skipped,
    /// One group was cleared
    GroupReset,
    /// One group failed and was left for the next day
    GroupFailed,
    /// The fan-out over all groups finished
    Completed,
}

impl std::fmt::Display for ResetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResetEvent::Claimed => "claimed",
            ResetEvent::Skipped => "skipped",
            ResetEvent::GroupReset => "group_reset",
            ResetEvent::GroupFailed => "group_failed",
            ResetEvent::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Install the global `fmt` subscriber at the configured level.
///
/// Does nothing when logging is disabled. Fails if the level is unknown or a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> ResetResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let level = Level::from_str(&config.level)
        .map_err(|e| ResetError::ConfigError(format!("invalid log level '{}': {e}", config.level)))?;

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| ResetError::ConfigError(format!("failed to install subscriber: {e}")))
}

/// Generate a new unique run ID.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one coordinator run.
pub fn reset_run_span(run_id: &str, date_key: &DateKey) -> Span {
    info_span!("daily_reset", run_id = %run_id, date_key = %date_key)
}

/// Log a reset lifecycle event.
///
/// # Arguments
///
/// * `event` - The type of reset event
/// * `subject` - The group id, or the date key for run-level events
/// * `details` - Optional additional details about the event
pub fn log_reset_event(event: ResetEvent, subject: &str, details: Option<&str>) {
    match (event, details) {
        (ResetEvent::GroupFailed, Some(d)) => {
            error!(event = %event, subject = %subject, reason = %d, "Reset event occurred")
        }
        (ResetEvent::GroupFailed, None) => {
            error!(event = %event, subject = %subject, "Reset event occurred")
        }
        (_, Some(d)) => info!(event = %event, subject = %subject, details = %d, "Reset event occurred"),
        (_, None) => info!(event = %event, subject = %subject, "Reset event occurred"),
    }
}
