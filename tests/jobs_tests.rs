//! Integration tests for the daily reset job over the in-memory store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use roster_reset::config::BatchConfig;
use roster_reset::jobs::{DailyResetCoordinator, ResetOutcome, RosterResetter};
use roster_reset::store::{ControlRecord, MemoryStore, RosterEntry, RosterStore};
use roster_reset::{DateKey, ManualClock, ResetCalendar};

/// 2025-03-14 22:30 UTC, i.e. 01:30 on 2025-03-15 in Istanbul.
fn just_after_istanbul_midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 22, 30, 0).unwrap()
}

/// Helper to build a store, a clock and a coordinator sharing them.
fn setup(now: DateTime<Utc>) -> (Arc<MemoryStore>, Arc<ManualClock>, DailyResetCoordinator) {
    let clock = Arc::new(ManualClock::new(now));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let coordinator = DailyResetCoordinator::new(
        store.clone(),
        clock.clone(),
        ResetCalendar::new("Europe/Istanbul"),
        &BatchConfig::default(),
    );
    (store, clock, coordinator)
}

/// Helper to board `count` riders in a group.
fn board_riders(store: &MemoryStore, group_id: &str, count: usize, joined_at: DateTime<Utc>) {
    for i in 0..count {
        store
            .put_roster_entry(group_id, RosterEntry::boarded(&format!("rider-{i:05}"), joined_at))
            .expect("failed to seed roster entry");
    }
}

// ============================================================================
// Coordinator Tests
// ============================================================================

#[tokio::test]
async fn second_invocation_on_same_day_is_a_no_op() {
    let now = just_after_istanbul_midnight();
    let (store, clock, coordinator) = setup(now);
    board_riders(&store, "north", 3, now - Duration::hours(12));

    let first = coordinator.ensure_daily_reset().await.expect("first run failed");
    assert!(first.did_reset());
    assert_eq!(first.date_key().as_str(), "2025-03-15");

    // Later the same Istanbul day
    clock.advance(Duration::hours(20));
    let commits_before = store.stats().unwrap().batch_commits;

    let second = coordinator.ensure_daily_reset().await.expect("second run failed");
    match second {
        ResetOutcome::AlreadyReset { date_key, recorded } => {
            assert_eq!(date_key.as_str(), "2025-03-15");
            assert_eq!(recorded.as_str(), "2025-03-15");
        }
        other => panic!("expected AlreadyReset, got {other:?}"),
    }

    let stats = store.stats().unwrap();
    assert_eq!(stats.batch_commits, commits_before);
    assert_eq!(stats.group_listings, 1);
}

#[tokio::test]
async fn new_timezone_date_triggers_another_reset() {
    // 20:00 UTC = 23:00 Istanbul on the 14th
    let now = Utc.with_ymd_and_hms(2025, 3, 14, 20, 0, 0).unwrap();
    let (store, clock, coordinator) = setup(now);
    board_riders(&store, "north", 2, now);

    let first = coordinator.ensure_daily_reset().await.unwrap();
    assert_eq!(first.date_key().as_str(), "2025-03-14");

    // Riders board again, then Istanbul midnight passes while UTC is still the 14th
    board_riders(&store, "north", 2, now + Duration::minutes(30));
    clock.advance(Duration::hours(1) + Duration::minutes(30));

    let second = coordinator.ensure_daily_reset().await.unwrap();
    assert!(second.did_reset());
    assert_eq!(second.date_key().as_str(), "2025-03-15");
    assert!(store.roster("north").unwrap().iter().all(|e| e.is_cleared()));

    let record = store.control_record().await.unwrap().unwrap();
    assert_eq!(record.last_reset_date.as_str(), "2025-03-15");
}

#[tokio::test]
async fn reset_clears_every_entry_and_stamps_every_group() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, coordinator) = setup(now);
    board_riders(&store, "north", 5, now - Duration::hours(10));
    board_riders(&store, "south", 2, now - Duration::hours(9));
    store.insert_group("empty").unwrap();

    let outcome = coordinator.ensure_daily_reset().await.unwrap();
    let ResetOutcome::Reset { report, .. } = outcome else {
        panic!("expected a reset");
    };
    assert!(report.is_complete());
    assert_eq!(report.groups_reset, 3);
    assert_eq!(report.entries_cleared, 7);

    for group in ["north", "south"] {
        for entry in store.roster(group).unwrap() {
            assert!(!entry.is_on_bus);
            assert_eq!(entry.joined_at, None);
            assert!(entry.updated_at.unwrap() >= now);
        }
    }

    // Stamped even with no roster entries
    assert_eq!(store.group_last_reset_at("empty").unwrap(), Some(now));
    assert_eq!(store.group_last_reset_at("north").unwrap(), Some(now));
}

#[tokio::test]
async fn concurrent_invocations_reset_exactly_once() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, coordinator) = setup(now);
    board_riders(&store, "north", 450, now - Duration::hours(8));

    let a = coordinator.clone();
    let b = coordinator.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.ensure_daily_reset().await }),
        tokio::spawn(async move { b.ensure_daily_reset().await }),
    );

    let outcomes = [
        first.expect("task panicked").expect("reset failed"),
        second.expect("task panicked").expect("reset failed"),
    ];
    let resets = outcomes.iter().filter(|o| o.did_reset()).count();
    assert_eq!(resets, 1);

    let stats = store.stats().unwrap();
    assert_eq!(stats.claims, 2);
    assert_eq!(stats.group_listings, 1);
    assert_eq!(stats.batch_sizes, vec![400, 50]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_invocations_on_worker_threads_reset_exactly_once() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, coordinator) = setup(now);
    board_riders(&store, "north", 10, now);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_daily_reset().await })
        })
        .collect();

    let mut resets = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().did_reset() {
            resets += 1;
        }
    }

    assert_eq!(resets, 1);
    assert_eq!(store.stats().unwrap().group_stamps, 1);
}

#[tokio::test]
async fn failing_group_does_not_stop_the_others() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, coordinator) = setup(now);
    board_riders(&store, "alpha", 3, now);
    board_riders(&store, "bravo", 3, now);
    board_riders(&store, "charlie", 3, now);
    store.fail_commits_for("bravo").unwrap();

    let ResetOutcome::Reset { report, .. } = coordinator.ensure_daily_reset().await.unwrap()
    else {
        panic!("expected a reset");
    };

    assert!(!report.is_complete());
    assert_eq!(report.groups_reset, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].group_id, "bravo");

    assert!(store.roster("alpha").unwrap().iter().all(|e| e.is_cleared()));
    assert!(store.roster("charlie").unwrap().iter().all(|e| e.is_cleared()));
    assert!(store.roster("bravo").unwrap().iter().all(|e| e.is_on_bus));
    assert_eq!(store.group_last_reset_at("bravo").unwrap(), None);

    // The day stays claimed
    let again = coordinator.ensure_daily_reset().await.unwrap();
    assert!(!again.did_reset());
}

#[tokio::test]
async fn clock_moving_backwards_never_regresses_the_record() {
    let now = just_after_istanbul_midnight();
    let (store, clock, coordinator) = setup(now);
    store
        .set_control_record(ControlRecord {
            last_reset_date: DateKey::parse("2025-03-15").unwrap(),
            updated_at: now,
        })
        .unwrap();

    clock.set(now - Duration::days(2));
    let outcome = coordinator.ensure_daily_reset().await.unwrap();
    assert!(!outcome.did_reset());

    let record = store.control_record().await.unwrap().unwrap();
    assert_eq!(record.last_reset_date.as_str(), "2025-03-15");
}

#[tokio::test]
async fn oversized_batch_limit_is_held_to_store_ceiling() {
    let now = just_after_istanbul_midnight();
    let clock = Arc::new(ManualClock::new(now));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    board_riders(&store, "g", 600, now - Duration::hours(2));

    let coordinator = DailyResetCoordinator::new(
        store.clone(),
        clock.clone(),
        ResetCalendar::new("Europe/Istanbul"),
        &BatchConfig {
            batch_size: 1000,
            ..BatchConfig::default()
        },
    );

    let ResetOutcome::Reset { report, .. } = coordinator.ensure_daily_reset().await.unwrap()
    else {
        panic!("expected a reset");
    };

    assert!(report.is_complete(), "failures: {:?}", report.failures);
    assert_eq!(report.entries_cleared, 600);
    assert_eq!(store.stats().unwrap().batch_sizes, vec![500, 100]);
    assert!(store.roster("g").unwrap().iter().all(|e| e.is_cleared()));
    assert!(store.group_last_reset_at("g").unwrap().is_some());
}

// ============================================================================
// Roster Resetter Tests
// ============================================================================

#[tokio::test]
async fn thousand_and_one_entries_commit_in_three_batches() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, _coordinator) = setup(now);
    board_riders(&store, "big", 1001, now - Duration::hours(5));

    let resetter = RosterResetter::new(store.clone());
    let summary = resetter
        .reset_roster_for_group(Some("big"))
        .await
        .expect("reset failed");

    assert_eq!(summary.entries_cleared, 1001);
    assert_eq!(summary.batches_committed, 3);

    let stats = store.stats().unwrap();
    assert_eq!(stats.batch_commits, 3);
    assert_eq!(stats.batch_sizes, vec![400, 400, 201]);

    let roster = store.roster("big").unwrap();
    assert_eq!(roster.len(), 1001);
    assert!(roster.iter().all(|e| e.is_cleared()));
}

#[tokio::test]
async fn empty_group_id_performs_no_store_operations() {
    let (store, _clock, _coordinator) = setup(just_after_istanbul_midnight());
    let resetter = RosterResetter::new(store.clone());

    resetter.reset_roster_for_group(Some("")).await.unwrap();
    resetter.reset_roster_for_group(None).await.unwrap();

    assert_eq!(store.stats().unwrap().total_operations(), 0);
}

#[tokio::test]
async fn group_without_entries_is_still_stamped() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, _coordinator) = setup(now);
    store.insert_group("quiet").unwrap();

    let resetter = RosterResetter::new(store.clone());
    let summary = resetter.reset_roster_for_group(Some("quiet")).await.unwrap();

    assert_eq!(summary.batches_committed, 0);
    assert_eq!(store.stats().unwrap().batch_commits, 0);
    assert_eq!(store.group_last_reset_at("quiet").unwrap(), Some(now));
}

#[tokio::test]
async fn already_cleared_entries_are_rewritten_with_new_timestamp() {
    let now = just_after_istanbul_midnight();
    let (store, _clock, _coordinator) = setup(now);
    let earlier = now - Duration::days(1);
    store
        .put_roster_entry(
            "north",
            RosterEntry {
                rider_id: "walker".to_string(),
                is_on_bus: false,
                joined_at: None,
                updated_at: Some(earlier),
            },
        )
        .unwrap();

    let resetter = RosterResetter::new(store.clone());
    resetter.reset_roster_for_group(Some("north")).await.unwrap();

    let entry = &store.roster("north").unwrap()[0];
    assert!(entry.is_cleared());
    assert_eq!(entry.updated_at, Some(now));
}

#[tokio::test]
async fn store_name_is_reported() {
    let store = MemoryStore::new();
    assert_eq!(store.name(), "memory");
}
