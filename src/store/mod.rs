//! Document store abstraction for the roster reset.
//!
//! The job touches three kinds of records:
//! - the `systemSettings/dailyRosterReset` control record (idempotency gate)
//! - `groups/{groupId}` documents (only `lastResetAt` is written)
//! - `groups/{groupId}/busRoster/{riderId}` entries (boarding state)
//!
//! Implementations:
//! - `memory` → in-process store, used by tests and embedders
//! - `sql`    → SQLite/Postgres via sqlx (requires the `sql` feature)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::DateKey;
use crate::config::MAX_BATCH_SIZE;
use crate::errors::{ResetError, ResetResult};

#[cfg(all(feature = "sql", not(any(feature = "sqlite", feature = "postgres"))))]
compile_error!("The 'sql' feature needs a backend. Enable 'sqlite' or 'postgres'.");

pub mod memory;

#[cfg(feature = "sql")]
pub mod sql;

pub use memory::MemoryStore;

#[cfg(feature = "sql")]
pub use sql::SqlStore;

/// Document path of the control record, kept for log output.
pub const CONTROL_RECORD_PATH: &str = "systemSettings/dailyRosterReset";

/// One rider's boarding state within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sql", derive(sqlx::FromRow))]
pub struct RosterEntry {
    pub rider_id: String,
    pub is_on_bus: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RosterEntry {
    /// An entry for a rider currently on the bus.
    pub fn boarded(rider_id: &str, joined_at: DateTime<Utc>) -> Self {
        Self {
            rider_id: rider_id.to_string(),
            is_on_bus: true,
            joined_at: Some(joined_at),
            updated_at: Some(joined_at),
        }
    }

    /// True once the entry carries the cleared boarding state.
    pub fn is_cleared(&self) -> bool {
        !self.is_on_bus && self.joined_at.is_none()
    }
}

/// The singleton control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub last_reset_date: DateKey,
    pub updated_at: DateTime<Utc>,
}

/// Result of the transactional check-and-set on the control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller advanced the record to today and owns today's reset.
    Claimed,
    /// The record already holds today's key (or a later one).
    AlreadyClaimed { recorded: DateKey },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Merge-update clearing one roster entry:
/// `isOnBus = false`, `joinedAt = null`, `updatedAt = <store time>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearBoarding {
    pub group_id: String,
    pub rider_id: String,
}

/// Writes committed together, all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<ClearBoarding>,
}

impl WriteBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            writes: Vec::with_capacity(capacity),
        }
    }

    pub fn clear_boarding(&mut self, group_id: &str, rider_id: &str) {
        self.writes.push(ClearBoarding {
            group_id: group_id.to_string(),
            rider_id: rider_id.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[ClearBoarding] {
        &self.writes
    }

    /// Reject a batch larger than the store's per-commit write limit.
    pub fn check_limit(&self) -> ResetResult<()> {
        if self.len() > MAX_BATCH_SIZE {
            return Err(ResetError::StoreError(format!(
                "batch of {} writes exceeds the limit of {MAX_BATCH_SIZE}",
                self.len()
            )));
        }
        Ok(())
    }
}

/// Storage operations the reset job needs.
///
/// Timestamps written by `commit_batch`, `stamp_group_reset` and
/// `claim_reset_date` are assigned by the store, like server timestamps.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Human-readable store name for logging.
    fn name(&self) -> &'static str;

    /// Atomically compare the control record with `today` and advance it.
    ///
    /// Two concurrent calls with the same key must not both return
    /// [`ClaimOutcome::Claimed`]. A recorded key is never moved backwards.
    async fn claim_reset_date(&self, today: &DateKey) -> ResetResult<ClaimOutcome>;

    /// Current control record, if it was ever written.
    async fn control_record(&self) -> ResetResult<Option<ControlRecord>>;

    /// Ids of every group.
    async fn list_group_ids(&self) -> ResetResult<Vec<String>>;

    /// Up to `limit` roster entries of `group_id` ordered by rider id,
    /// starting strictly after `after`.
    async fn fetch_roster_page(
        &self,
        group_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> ResetResult<Vec<RosterEntry>>;

    /// Apply every write in `batch` atomically.
    async fn commit_batch(&self, batch: &WriteBatch) -> ResetResult<()>;

    /// Merge-update `groups/{group_id}.lastResetAt` to the store's time.
    async fn stamp_group_reset(&self, group_id: &str) -> ResetResult<()>;
}

/// Whether a control record holding `recorded` still needs today's reset.
///
/// Keys later than today mean the clock moved backwards; those are left
/// alone so the record never regresses.
pub fn reset_due(recorded: Option<&DateKey>, today: &DateKey) -> bool {
    match recorded {
        Some(recorded) => recorded < today,
        None => true,
    }
}
