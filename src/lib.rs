//! Roster Reset - clears the bus-boarding state of every group roster once a
//! day, at midnight in a fixed timezone.
//!
//! # Features
//!
//! - `sqlite` - SQLite-backed store. Enabled by default.
//! - `postgres` - PostgreSQL-backed store.
//! - `background-jobs` - Cron scheduler firing the reset. Enabled by default.
//!
//! # Example
//!
//! ```toml
//! # Use defaults (sqlite + background-jobs)
//! roster-reset = { path = "." }
//!
//! # Library only, in-memory store
//! roster-reset = { path = ".", default-features = false }
//!
//! # Scheduler over PostgreSQL
//! roster-reset = { path = ".", default-features = false, features = ["postgres", "background-jobs"] }
//! ```

pub mod calendar;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod store;

pub use calendar::{Clock, DateKey, ManualClock, ResetCalendar, SystemClock};
pub use errors::{ResetError, ResetResult};
pub use jobs::{DailyResetCoordinator, ResetOutcome, RosterResetter};
pub use store::{MemoryStore, RosterEntry, RosterStore};
