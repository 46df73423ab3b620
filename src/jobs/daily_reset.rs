//! Daily reset coordinator.
//!
//! Decides, once per calendar day in the reset timezone, whether the global
//! roster reset is due, and if so fans out over every group.

use std::sync::Arc;
use tracing::{debug, Instrument};

use crate::calendar::{Clock, DateKey, ResetCalendar, SystemClock};
use crate::config::{BatchConfig, ResetConfig};
use crate::errors::ResetResult;
use crate::logging::{generate_run_id, log_reset_event, reset_run_span, ResetEvent};
use crate::store::{ClaimOutcome, RosterStore, CONTROL_RECORD_PATH};

use super::roster_reset::{GroupResetSummary, RosterResetter};

/// A group whose reset failed during the fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFailure {
    pub group_id: String,
    pub error: String,
}

/// Aggregate result of resetting every group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub groups_reset: usize,
    pub entries_cleared: usize,
    pub batches_committed: usize,
    pub failures: Vec<GroupFailure>,
}

impl FanOutReport {
    fn record(&mut self, summary: GroupResetSummary) {
        self.groups_reset += 1;
        self.entries_cleared += summary.entries_cleared;
        self.batches_committed += summary.batches_committed;
    }

    /// True when every group was reset.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What `ensure_daily_reset` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The control record already held today's key; nothing was written.
    AlreadyReset { date_key: DateKey, recorded: DateKey },
    /// This run claimed the day and reset the groups.
    Reset { date_key: DateKey, report: FanOutReport },
}

impl ResetOutcome {
    pub fn date_key(&self) -> &DateKey {
        match self {
            ResetOutcome::AlreadyReset { date_key, .. } | ResetOutcome::Reset { date_key, .. } => {
                date_key
            }
        }
    }

    pub fn did_reset(&self) -> bool {
        matches!(self, ResetOutcome::Reset { .. })
    }
}

/// Runs the idempotent daily reset against a store.
#[derive(Clone)]
pub struct DailyResetCoordinator {
    store: Arc<dyn RosterStore>,
    clock: Arc<dyn Clock>,
    calendar: ResetCalendar,
    resetter: RosterResetter,
}

impl DailyResetCoordinator {
    pub fn new(
        store: Arc<dyn RosterStore>,
        clock: Arc<dyn Clock>,
        calendar: ResetCalendar,
        limits: &BatchConfig,
    ) -> Self {
        let resetter = RosterResetter::with_limits(Arc::clone(&store), limits);
        Self {
            store,
            clock,
            calendar,
            resetter,
        }
    }

    /// Coordinator on the system clock with the configured timezone and limits.
    pub fn from_config(store: Arc<dyn RosterStore>, config: &ResetConfig) -> Self {
        Self::new(
            store,
            Arc::new(SystemClock),
            ResetCalendar::new(&config.schedule.timezone),
            &config.reset,
        )
    }

    pub fn calendar(&self) -> &ResetCalendar {
        &self.calendar
    }

    pub fn resetter(&self) -> &RosterResetter {
        &self.resetter
    }

    /// Perform at most one global reset per calendar day.
    ///
    /// Claim failures propagate, since nothing has been written yet and a
    /// retry is safe. Once the day is claimed, a failing group is logged and
    /// recorded in the report while the remaining groups are still reset.
    pub async fn ensure_daily_reset(&self) -> ResetResult<ResetOutcome> {
        let date_key = self.calendar.today(self.clock.as_ref());
        let run_id = generate_run_id();
        let span = reset_run_span(&run_id, &date_key);

        self.run(date_key).instrument(span).await
    }

    async fn run(&self, date_key: DateKey) -> ResetResult<ResetOutcome> {
        debug!(
            store = self.store.name(),
            record = CONTROL_RECORD_PATH,
            timezone = self.calendar.timezone_name(),
            "Checking daily reset"
        );

        match self.store.claim_reset_date(&date_key).await? {
            ClaimOutcome::AlreadyClaimed { recorded } => {
                log_reset_event(
                    ResetEvent::Skipped,
                    date_key.as_str(),
                    Some(&format!("already reset for {recorded}")),
                );
                return Ok(ResetOutcome::AlreadyReset { date_key, recorded });
            }
            ClaimOutcome::Claimed => {
                log_reset_event(ResetEvent::Claimed, date_key.as_str(), None);
            }
        }

        let report = self.reset_all_groups().await?;

        log_reset_event(
            ResetEvent::Completed,
            date_key.as_str(),
            Some(&format!(
                "{} groups, {} entries, {} batches, {} failures",
                report.groups_reset,
                report.entries_cleared,
                report.batches_committed,
                report.failures.len()
            )),
        );

        Ok(ResetOutcome::Reset { date_key, report })
    }

    /// Reset every group one at a time, continuing past failures.
    async fn reset_all_groups(&self) -> ResetResult<FanOutReport> {
        let group_ids = self.store.list_group_ids().await?;
        let mut report = FanOutReport::default();

        for group_id in group_ids {
            match self.resetter.reset_roster_for_group(Some(&group_id)).await {
                Ok(summary) => {
                    log_reset_event(ResetEvent::GroupReset, &group_id, None);
                    report.record(summary);
                }
                Err(e) => {
                    log_reset_event(ResetEvent::GroupFailed, &group_id, Some(&e.to_string()));
                    report.failures.push(GroupFailure {
                        group_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}
