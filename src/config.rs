//! Configuration system for the roster reset job.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `config.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `ROSTER_RESET_TIMEZONE` - IANA timezone the daily reset is bound to
//! - `ROSTER_RESET_CRON` - Six-field cron expression (with seconds)
//! - `ROSTER_RESET_SCHEDULE_ENABLED` - Register the scheduled job at all
//! - `ROSTER_RESET_BATCH_SIZE` - Writes per atomic batch commit
//! - `ROSTER_RESET_PAGE_SIZE` - Roster entries fetched per page
//! - `ROSTER_RESET_DATABASE_TYPE` - `sqlite` or `postgres`
//! - `ROSTER_RESET_DATABASE_URL` - Connection URL (routed by scheme)
//! - `ROSTER_RESET_LOGGING_ENABLED` - Install the tracing subscriber
//! - `ROSTER_RESET_LOG_LEVEL` - Log level (trace, debug, info, warn, error)

use config::Config;
use serde::Deserialize;
use std::env;
use std::sync::OnceLock;

use crate::errors::{ResetError, ResetResult};

/// Timezone whose midnight triggers the reset.
pub const DEFAULT_TIMEZONE: &str = "Europe/Istanbul";

/// Midnight every day, seconds field first.
pub const DEFAULT_CRON: &str = "0 0 0 * * *";

/// Writes per batch. The store rejects batches above [`MAX_BATCH_SIZE`].
pub const DEFAULT_BATCH_SIZE: usize = 400;

/// Hard per-batch write ceiling of the document store.
pub const MAX_BATCH_SIZE: usize = 500;

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Global configuration singleton.
static CONFIG: OnceLock<ResetConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// When and in which timezone the job fires
    pub schedule: ScheduleConfig,
    /// Batching and paging limits
    pub reset: BatchConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Schedule configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA timezone name, e.g. "Europe/Istanbul"
    pub timezone: String,
    /// Cron expression with a leading seconds field
    pub cron: String,
    /// Whether the scheduler registers the reset job
    pub enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            cron: DEFAULT_CRON.to_string(),
            enabled: true,
        }
    }
}

/// Write batching configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub page_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database type: "sqlite" or "postgres"
    pub db_type: String,
    /// SQLite connection URL
    pub sqlite_url: String,
    /// PostgreSQL connection URL
    pub postgres_url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            sqlite_url: "sqlite://roster.db?mode=rwc".to_string(),
            postgres_url: "postgres://localhost/roster".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

fn config_err(e: config::ConfigError) -> ResetError {
    ResetError::ConfigError(e.to_string())
}

impl ResetConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. `config.toml` file (optional)
    /// 3. Environment variables
    pub fn load() -> ResetResult<Self> {
        let database_url = env::var("ROSTER_RESET_DATABASE_URL").ok();

        let builder = Config::builder()
            .set_default("schedule.timezone", DEFAULT_TIMEZONE)
            .map_err(config_err)?
            .set_default("schedule.cron", DEFAULT_CRON)
            .map_err(config_err)?
            .set_default("schedule.enabled", true)
            .map_err(config_err)?
            .set_default("reset.batch_size", DEFAULT_BATCH_SIZE as i64)
            .map_err(config_err)?
            .set_default("reset.page_size", DEFAULT_PAGE_SIZE as i64)
            .map_err(config_err)?
            .set_default("database.db_type", "sqlite")
            .map_err(config_err)?
            .set_default("database.sqlite_url", "sqlite://roster.db?mode=rwc")
            .map_err(config_err)?
            .set_default("database.postgres_url", "postgres://localhost/roster")
            .map_err(config_err)?
            .set_default("logging.enabled", true)
            .map_err(config_err)?
            .set_default("logging.level", "info")
            .map_err(config_err)?
            // Load from config.toml (optional)
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables
            .set_override_option("schedule.timezone", env::var("ROSTER_RESET_TIMEZONE").ok())
            .map_err(config_err)?
            .set_override_option("schedule.cron", env::var("ROSTER_RESET_CRON").ok())
            .map_err(config_err)?
            .set_override_option(
                "schedule.enabled",
                env::var("ROSTER_RESET_SCHEDULE_ENABLED")
                    .ok()
                    .and_then(|v| v.parse::<bool>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "reset.batch_size",
                env::var("ROSTER_RESET_BATCH_SIZE")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "reset.page_size",
                env::var("ROSTER_RESET_PAGE_SIZE")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.db_type",
                env::var("ROSTER_RESET_DATABASE_TYPE").ok(),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.sqlite_url",
                database_url
                    .clone()
                    .filter(|url| url.starts_with("sqlite")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.postgres_url",
                database_url.filter(|url| url.starts_with("postgres")),
            )
            .map_err(config_err)?
            .set_override_option(
                "logging.enabled",
                env::var("ROSTER_RESET_LOGGING_ENABLED")
                    .ok()
                    .and_then(|v| v.parse::<bool>().ok()),
            )
            .map_err(config_err)?
            .set_override_option("logging.level", env::var("ROSTER_RESET_LOG_LEVEL").ok())
            .map_err(config_err)?;

        let settings = builder
            .build()
            .map_err(|e| ResetError::ConfigError(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| ResetError::ConfigError(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// The timezone is deliberately not validated here: an unknown zone falls
    /// back to the host's local date when computing the date key.
    pub fn validate(&self) -> ResetResult<()> {
        if self.schedule.cron.split_whitespace().count() < 6 {
            return Err(ResetError::ConfigError(format!(
                "schedule.cron must have a leading seconds field, got '{}'",
                self.schedule.cron
            )));
        }

        if self.reset.batch_size == 0 || self.reset.batch_size > MAX_BATCH_SIZE {
            return Err(ResetError::ConfigError(format!(
                "reset.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.reset.batch_size
            )));
        }

        if self.reset.page_size == 0 {
            return Err(ResetError::ConfigError(
                "reset.page_size must be greater than 0".to_string(),
            ));
        }

        match self.database.db_type.as_str() {
            "sqlite" | "postgres" => {}
            other => {
                return Err(ResetError::ConfigError(format!(
                    "database.db_type must be 'sqlite' or 'postgres', got '{other}'"
                )));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ResetError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// This loads the configuration on first access and caches it.
/// Returns an error if configuration loading or validation fails.
pub fn get_config() -> ResetResult<&'static ResetConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = ResetConfig::load()?;
    config.validate()?;

    // Another thread may have won the race; either value is fine
    let _ = CONFIG.set(config);

    CONFIG
        .get()
        .ok_or_else(|| ResetError::ConfigError("configuration was not stored".to_string()))
}
