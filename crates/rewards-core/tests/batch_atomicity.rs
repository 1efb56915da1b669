//! Batch execution must apply completely or leave no observable change,
//! on both the native-transaction and compensating-rollback paths.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use rewards_core::clock::{ManualClock, SequenceIds};
use rewards_core::error::LedgerError;
use rewards_core::model::{
    CategoryPatch, EntryType, RedemptionTransaction, RewardCategory, RewardEntry,
};
use rewards_core::storage::BatchOperation;
use rewards_core::{BatchExecutor, Clock, LedgerStore, MemoryStore, SqliteStore};

const USER: &str = "user-1";

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
    ))
}

fn backends(clock: Arc<ManualClock>) -> Vec<(&'static str, Arc<dyn LedgerStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new(clock.clone()))),
        (
            "sqlite",
            Arc::new(SqliteStore::open_in_memory(clock).expect("open in-memory sqlite")),
        ),
    ]
}

fn category(id: &str, name: &str) -> RewardCategory {
    RewardCategory::new(id, name, None, "#336699", "star", false).expect("valid category")
}

fn entry(clock: &ManualClock, id: &str, category_id: &str, points: i64) -> RewardEntry {
    RewardEntry::new(id, USER, points, "chore", category_id, EntryType::Earned, clock.now())
        .expect("valid entry")
}

fn redemption(clock: &ManualClock) -> RedemptionTransaction {
    let ids = SequenceIds::default();
    RedemptionTransaction::create(USER, "opt-1", 250, Some("movie night"), &ids, clock)
        .expect("valid redemption")
}

#[test]
fn test_batch_applies_all_operations_in_order() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        let executor = BatchExecutor::new(store.clone());
        let results = executor
            .apply(&[
                BatchOperation::AddCategory {
                    owner_id: USER.to_string(),
                    category: category("cat-1", "Chores"),
                },
                BatchOperation::AddEntry(entry(&clock, "e-1", "cat-1", 300)),
                BatchOperation::AddRedemption(redemption(&clock)),
                BatchOperation::AddEntry(entry(&clock, "e-2", "cat-1", -250)),
            ])
            .expect("batch applies");

        assert_eq!(results.len(), 4, "{name}");
        assert_eq!(store.total_points(USER).unwrap(), 50, "{name}");
        assert_eq!(store.list_redemptions(USER).unwrap().len(), 1, "{name}");
    }
}

#[test]
fn test_batch_deletions_contribute_no_output_record() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        store.add_category(USER, category("cat-1", "Chores")).unwrap();
        store.add_entry(entry(&clock, "e-1", "cat-1", 10)).unwrap();

        let executor = BatchExecutor::new(store.clone());
        let results = executor
            .apply(&[
                BatchOperation::AddEntry(entry(&clock, "e-2", "cat-1", 5)),
                BatchOperation::DeleteEntry {
                    entry_id: "e-1".to_string(),
                    requesting_user_id: USER.to_string(),
                },
            ])
            .expect("batch applies");
        assert_eq!(results.len(), 1, "{name}");
        assert!(store.get_entry(USER, "e-1").unwrap().is_none(), "{name}");
    }
}

#[test]
fn test_mid_batch_failure_leaves_no_observable_change() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        store.add_category(USER, category("cat-1", "Chores")).unwrap();
        store.add_entry(entry(&clock, "e-0", "cat-1", 100)).unwrap();

        let executor = BatchExecutor::new(store.clone());
        // third op references a category that does not exist
        let err = executor
            .apply(&[
                BatchOperation::AddEntry(entry(&clock, "e-1", "cat-1", 40)),
                BatchOperation::DeleteEntry {
                    entry_id: "e-0".to_string(),
                    requesting_user_id: USER.to_string(),
                },
                BatchOperation::AddEntry(entry(&clock, "e-2", "missing", 5)),
            ])
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)), "{name}: {err}");

        assert_eq!(store.total_points(USER).unwrap(), 100, "{name}");
        assert!(store.get_entry(USER, "e-0").unwrap().is_some(), "{name}");
        assert!(store.get_entry(USER, "e-1").unwrap().is_none(), "{name}");
        assert!(store.get_entry(USER, "e-2").unwrap().is_none(), "{name}");
    }
}

#[test]
fn test_failed_update_rolls_back_earlier_operations() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        store.add_category(USER, category("cat-1", "Chores")).unwrap();
        let stored = store.add_entry(entry(&clock, "e-1", "cat-1", 10)).unwrap();

        let renamed = store
            .get_category(USER, "cat-1")
            .unwrap()
            .unwrap()
            .update(CategoryPatch {
                name: Some("Renamed".to_string()),
                ..Default::default()
            })
            .unwrap();

        let mut stale = stored;
        stale.user_id = "intruder".to_string();

        let executor = BatchExecutor::new(store.clone());
        let err = executor
            .apply(&[
                BatchOperation::UpdateCategory {
                    owner_id: USER.to_string(),
                    category: renamed,
                },
                BatchOperation::UpdateEntry(stale),
            ])
            .unwrap_err();
        assert!(
            matches!(err, LedgerError::Authorization(_) | LedgerError::NotFound(_)),
            "{name}: {err}"
        );
        assert_eq!(
            store.get_category(USER, "cat-1").unwrap().unwrap().name,
            "Chores",
            "{name}: category update rolled back"
        );
    }
}

#[test]
fn test_rollback_failure_surfaces_partial_application() {
    // Compensating path only: delete the category an earlier-deleted entry
    // references, so re-adding the entry during rollback cannot succeed.
    let clock = manual_clock();
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new(clock.clone()));
    store.add_category(USER, category("cat-1", "Chores")).unwrap();
    store.add_entry(entry(&clock, "e-1", "cat-1", 10)).unwrap();

    let executor = BatchExecutor::new(store.clone());
    let err = executor
        .apply(&[
            BatchOperation::DeleteCategory {
                owner_id: USER.to_string(),
                category_id: "cat-1".to_string(),
            },
            BatchOperation::DeleteEntry {
                entry_id: "e-1".to_string(),
                requesting_user_id: USER.to_string(),
            },
            BatchOperation::AddEntry(entry(&clock, "e-2", "missing", 5)),
        ])
        .unwrap_err();

    assert!(
        matches!(err, LedgerError::PartialApplication(_)),
        "expected PartialApplication, got: {err}"
    );
}

#[test]
fn test_sqlite_batch_uses_native_transaction() {
    let clock = manual_clock();
    let store = Arc::new(SqliteStore::open_in_memory(clock.clone()).expect("open"));
    assert!(store.supports_transactions());

    store.add_category(USER, category("cat-1", "Chores")).unwrap();
    let executor = BatchExecutor::new(store.clone());

    // a failure anywhere rolls back the whole transaction
    let err = executor
        .apply(&[
            BatchOperation::AddEntry(entry(&clock, "e-1", "cat-1", 40)),
            BatchOperation::AddEntry(entry(&clock, "e-1", "cat-1", 40)),
        ])
        .unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)), "{err}");
    assert_eq!(store.total_points(USER).unwrap(), 0);

    executor
        .apply(&[BatchOperation::AddEntry(entry(&clock, "e-1", "cat-1", 40))])
        .expect("clean batch applies");
    assert_eq!(store.total_points(USER).unwrap(), 40);
}
