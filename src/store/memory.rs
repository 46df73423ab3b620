//! In-memory document store.
//!
//! Every operation takes the single state lock for its whole duration, which
//! makes each call (including the control record check-and-set) atomic with
//! respect to other callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{reset_due, ClaimOutcome, ControlRecord, RosterEntry, RosterStore, WriteBatch};
use crate::calendar::{Clock, DateKey, SystemClock};
use crate::errors::{ResetError, ResetResult};

/// Counts of store calls, for asserting on database traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub claims: usize,
    pub group_listings: usize,
    pub page_reads: usize,
    pub batch_commits: usize,
    pub group_stamps: usize,
    /// Size of every committed batch, in commit order.
    pub batch_sizes: Vec<usize>,
}

impl StoreStats {
    pub fn total_operations(&self) -> usize {
        self.claims + self.group_listings + self.page_reads + self.batch_commits + self.group_stamps
    }
}

#[derive(Debug, Default)]
struct GroupDoc {
    last_reset_at: Option<DateTime<Utc>>,
    roster: BTreeMap<String, RosterEntry>,
}

#[derive(Debug, Default)]
struct MemoryState {
    control: Option<ControlRecord>,
    groups: BTreeMap<String, GroupDoc>,
    failing_groups: HashSet<String>,
    stats: StoreStats,
}

/// Document store held entirely in process memory.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose server timestamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    fn lock(&self) -> ResetResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ResetError::StoreError("failed to acquire memory store lock".into()))
    }

    /// Create a group document if it does not exist yet.
    pub fn insert_group(&self, group_id: &str) -> ResetResult<()> {
        self.lock()?.groups.entry(group_id.to_string()).or_default();
        Ok(())
    }

    /// Insert or replace a roster entry, creating the group if needed.
    pub fn put_roster_entry(&self, group_id: &str, entry: RosterEntry) -> ResetResult<()> {
        self.lock()?
            .groups
            .entry(group_id.to_string())
            .or_default()
            .roster
            .insert(entry.rider_id.clone(), entry);
        Ok(())
    }

    /// Snapshot of a group's roster ordered by rider id.
    pub fn roster(&self, group_id: &str) -> ResetResult<Vec<RosterEntry>> {
        Ok(self
            .lock()?
            .groups
            .get(group_id)
            .map(|g| g.roster.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn group_last_reset_at(&self, group_id: &str) -> ResetResult<Option<DateTime<Utc>>> {
        Ok(self
            .lock()?
            .groups
            .get(group_id)
            .and_then(|g| g.last_reset_at))
    }

    /// Seed the control record directly, bypassing the claim logic.
    pub fn set_control_record(&self, record: ControlRecord) -> ResetResult<()> {
        self.lock()?.control = Some(record);
        Ok(())
    }

    /// Make every batch commit touching `group_id` fail.
    pub fn fail_commits_for(&self, group_id: &str) -> ResetResult<()> {
        self.lock()?.failing_groups.insert(group_id.to_string());
        Ok(())
    }

    pub fn stats(&self) -> ResetResult<StoreStats> {
        Ok(self.lock()?.stats.clone())
    }
}

#[async_trait]
impl RosterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn claim_reset_date(&self, today: &DateKey) -> ResetResult<ClaimOutcome> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.stats.claims += 1;

        let recorded = state.control.as_ref().map(|c| c.last_reset_date.clone());
        if !reset_due(recorded.as_ref(), today) {
            return Ok(ClaimOutcome::AlreadyClaimed {
                recorded: recorded.unwrap_or_else(|| today.clone()),
            });
        }

        state.control = Some(ControlRecord {
            last_reset_date: today.clone(),
            updated_at: now,
        });
        Ok(ClaimOutcome::Claimed)
    }

    async fn control_record(&self) -> ResetResult<Option<ControlRecord>> {
        Ok(self.lock()?.control.clone())
    }

    async fn list_group_ids(&self) -> ResetResult<Vec<String>> {
        let mut state = self.lock()?;
        state.stats.group_listings += 1;
        Ok(state.groups.keys().cloned().collect())
    }

    async fn fetch_roster_page(
        &self,
        group_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> ResetResult<Vec<RosterEntry>> {
        let mut state = self.lock()?;
        state.stats.page_reads += 1;

        let Some(group) = state.groups.get(group_id) else {
            return Ok(Vec::new());
        };

        let lower = match after {
            Some(rider_id) => Bound::Excluded(rider_id.to_string()),
            None => Bound::Unbounded,
        };

        Ok(group
            .roster
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn commit_batch(&self, batch: &WriteBatch) -> ResetResult<()> {
        batch.check_limit()?;

        let now = self.clock.now();
        let mut state = self.lock()?;

        // Validate before applying anything so a failed commit writes nothing
        if let Some(write) = batch
            .writes()
            .iter()
            .find(|w| state.failing_groups.contains(&w.group_id))
        {
            return Err(ResetError::StoreError(format!(
                "batch commit rejected for group {}",
                write.group_id
            )));
        }

        for write in batch.writes() {
            let entry = state
                .groups
                .entry(write.group_id.clone())
                .or_default()
                .roster
                .entry(write.rider_id.clone())
                .or_insert_with(|| RosterEntry {
                    rider_id: write.rider_id.clone(),
                    is_on_bus: false,
                    joined_at: None,
                    updated_at: None,
                });
            entry.is_on_bus = false;
            entry.joined_at = None;
            entry.updated_at = Some(now);
        }

        state.stats.batch_commits += 1;
        state.stats.batch_sizes.push(batch.len());
        Ok(())
    }

    async fn stamp_group_reset(&self, group_id: &str) -> ResetResult<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.stats.group_stamps += 1;
        state
            .groups
            .entry(group_id.to_string())
            .or_default()
            .last_reset_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ManualClock;
    use chrono::TimeZone;

    fn key(raw: &str) -> DateKey {
        DateKey::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn claim_is_once_per_key() {
        let store = MemoryStore::new();
        let today = key("2025-02-10");

        let first = store.claim_reset_date(&today).await.unwrap();
        assert_eq!(first, ClaimOutcome::Claimed);

        let second = store.claim_reset_date(&today).await.unwrap();
        assert_eq!(
            second,
            ClaimOutcome::AlreadyClaimed {
                recorded: today.clone()
            }
        );
    }

    #[tokio::test]
    async fn claim_never_regresses_the_record() {
        let store = MemoryStore::new();
        store.claim_reset_date(&key("2025-02-11")).await.unwrap();

        let outcome = store.claim_reset_date(&key("2025-02-10")).await.unwrap();
        assert!(!outcome.is_claimed());

        let record = store.control_record().await.unwrap().unwrap();
        assert_eq!(record.last_reset_date.as_str(), "2025-02-11");
    }

    #[tokio::test]
    async fn pages_resume_after_cursor() {
        let store = MemoryStore::new();
        let joined = Utc.with_ymd_and_hms(2025, 2, 10, 7, 0, 0).unwrap();
        for rider in ["a", "b", "c", "d", "e"] {
            store
                .put_roster_entry("g1", RosterEntry::boarded(rider, joined))
                .unwrap();
        }

        let first = store.fetch_roster_page("g1", None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.rider_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let next = store.fetch_roster_page("g1", Some("b"), 10).await.unwrap();
        let ids: Vec<_> = next.iter().map(|e| e.rider_id.as_str()).collect();
        assert_eq!(ids, ["c", "d", "e"]);
    }

    #[tokio::test]
    async fn failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        let joined = Utc.with_ymd_and_hms(2025, 2, 10, 7, 0, 0).unwrap();
        store
            .put_roster_entry("ok", RosterEntry::boarded("r1", joined))
            .unwrap();
        store
            .put_roster_entry("bad", RosterEntry::boarded("r2", joined))
            .unwrap();
        store.fail_commits_for("bad").unwrap();

        let mut batch = WriteBatch::default();
        batch.clear_boarding("ok", "r1");
        batch.clear_boarding("bad", "r2");
        assert!(store.commit_batch(&batch).await.is_err());

        assert!(store.roster("ok").unwrap()[0].is_on_bus);
        assert_eq!(store.stats().unwrap().batch_commits, 0);
    }

    #[tokio::test]
    async fn commit_uses_store_clock() {
        let at = Utc.with_ymd_and_hms(2025, 2, 10, 21, 0, 0).unwrap();
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(at)));
        store
            .put_roster_entry("g1", RosterEntry::boarded("r1", at))
            .unwrap();

        let mut batch = WriteBatch::default();
        batch.clear_boarding("g1", "r1");
        store.commit_batch(&batch).await.unwrap();
        store.stamp_group_reset("g1").await.unwrap();

        let entry = &store.roster("g1").unwrap()[0];
        assert!(entry.is_cleared());
        assert_eq!(entry.updated_at, Some(at));
        assert_eq!(store.group_last_reset_at("g1").unwrap(), Some(at));
    }
}
