//! Per-group roster reset.
//!
//! Clears the boarding state of every roster entry in one group, committing
//! the writes in bounded atomic batches, then stamps the group's
//! `lastResetAt`.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BatchConfig, DEFAULT_BATCH_SIZE, DEFAULT_PAGE_SIZE, MAX_BATCH_SIZE};
use crate::errors::ResetResult;
use crate::store::{RosterStore, WriteBatch};

/// What one group's reset did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupResetSummary {
    pub entries_cleared: usize,
    pub batches_committed: usize,
}

/// Clears boarding state group by group.
#[derive(Clone)]
pub struct RosterResetter {
    store: Arc<dyn RosterStore>,
    batch_size: usize,
    page_size: usize,
}

impl RosterResetter {
    /// Resetter with the default 400-write batches.
    pub fn new(store: Arc<dyn RosterStore>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Resetter with configured limits. `batch_size` is held to
    /// `1..=MAX_BATCH_SIZE` so every commit stays within the store limit.
    pub fn with_limits(store: Arc<dyn RosterStore>, limits: &BatchConfig) -> Self {
        Self {
            store,
            batch_size: limits.batch_size.clamp(1, MAX_BATCH_SIZE),
            page_size: limits.page_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reset every roster entry of `group_id`.
    ///
    /// An absent or empty id is a no-op that never touches the store.
    ///
    /// Entries are read page by page and every write lands in the current
    /// batch, which is committed as soon as it holds `batch_size` writes.
    /// Each commit is atomic on its own; a failure part-way through leaves
    /// earlier batches applied and the group unstamped.
    pub async fn reset_roster_for_group(
        &self,
        group_id: Option<&str>,
    ) -> ResetResult<GroupResetSummary> {
        let group_id = match group_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                debug!("Skipping roster reset for empty group id");
                return Ok(GroupResetSummary::default());
            }
        };

        let mut summary = GroupResetSummary::default();
        let mut batch = WriteBatch::with_capacity(self.batch_size);
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .fetch_roster_page(group_id, cursor.as_deref(), self.page_size)
                .await?;

            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.rider_id.clone());

            for entry in &page {
                batch.clear_boarding(group_id, &entry.rider_id);
                if batch.len() >= self.batch_size {
                    self.commit(&mut batch, &mut summary).await?;
                }
            }

            if page.len() < self.page_size {
                break;
            }
        }

        self.commit(&mut batch, &mut summary).await?;
        self.store.stamp_group_reset(group_id).await?;

        info!(
            group_id,
            entries = summary.entries_cleared,
            batches = summary.batches_committed,
            "Roster reset for group"
        );

        Ok(summary)
    }

    async fn commit(
        &self,
        batch: &mut WriteBatch,
        summary: &mut GroupResetSummary,
    ) -> ResetResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let full = std::mem::replace(batch, WriteBatch::with_capacity(self.batch_size));
        self.store.commit_batch(&full).await?;

        summary.entries_cleared += full.len();
        summary.batches_committed += 1;
        debug!(
            writes = full.len(),
            batch = summary.batches_committed,
            "Committed roster batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RosterEntry};
    use chrono::Utc;

    fn seeded_store(group_id: &str, riders: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let joined = Utc::now();
        for i in 0..riders {
            store
                .put_roster_entry(group_id, RosterEntry::boarded(&format!("rider-{i:05}"), joined))
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn empty_or_absent_group_id_touches_nothing() {
        let store = seeded_store("g1", 3);
        let resetter = RosterResetter::new(store.clone());

        let summary = resetter.reset_roster_for_group(Some("")).await.unwrap();
        assert_eq!(summary, GroupResetSummary::default());
        resetter.reset_roster_for_group(None).await.unwrap();

        assert_eq!(store.stats().unwrap().total_operations(), 0);
        assert!(store.roster("g1").unwrap().iter().all(|e| e.is_on_bus));
    }

    #[tokio::test]
    async fn exact_multiple_of_batch_size_needs_no_trailing_commit() {
        let store = seeded_store("g1", 800);
        let resetter = RosterResetter::new(store.clone());

        let summary = resetter.reset_roster_for_group(Some("g1")).await.unwrap();
        assert_eq!(summary.batches_committed, 2);
        assert_eq!(store.stats().unwrap().batch_sizes, vec![400, 400]);
    }

    #[tokio::test]
    async fn batches_span_page_boundaries() {
        let store = seeded_store("g1", 25);
        let limits = BatchConfig {
            batch_size: 10,
            page_size: 7,
        };
        let resetter = RosterResetter::with_limits(store.clone(), &limits);

        let summary = resetter.reset_roster_for_group(Some("g1")).await.unwrap();
        assert_eq!(summary.entries_cleared, 25);

        let stats = store.stats().unwrap();
        assert_eq!(stats.batch_sizes, vec![10, 10, 5]);
        // 7 + 7 + 7 + 4
        assert_eq!(stats.page_reads, 4);
        assert!(store.roster("g1").unwrap().iter().all(|e| e.is_cleared()));
    }

    #[tokio::test]
    async fn batch_size_is_clamped_to_store_limit() {
        let store = seeded_store("g1", 600);
        let limits = BatchConfig {
            batch_size: 1000,
            page_size: 1000,
        };
        let resetter = RosterResetter::with_limits(store.clone(), &limits);
        assert_eq!(resetter.batch_size(), MAX_BATCH_SIZE);

        resetter.reset_roster_for_group(Some("g1")).await.unwrap();
        assert_eq!(store.stats().unwrap().batch_sizes, vec![500, 100]);

        let zero = BatchConfig {
            batch_size: 0,
            page_size: 10,
        };
        assert_eq!(RosterResetter::with_limits(store, &zero).batch_size(), 1);
    }
}
