//! Contract tests run against both `LedgerStore` backends.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};

use rewards_core::clock::ManualClock;
use rewards_core::error::LedgerError;
use rewards_core::model::{EntryPatch, EntryType, RewardCategory, RewardEntry};
use rewards_core::storage::{
    DateRange, HistoryFilter, LedgerRecord, RecordKey, RecordKind, RemoteChange,
    MAX_CUSTOM_CATEGORIES,
};
use rewards_core::{Clock, LedgerStore, MemoryStore, SqliteStore};

const USER: &str = "user-1";

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
    ))
}

fn backends(clock: Arc<ManualClock>) -> Vec<(&'static str, Box<dyn LedgerStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::new(clock.clone()))),
        (
            "sqlite",
            Box::new(SqliteStore::open_in_memory(clock).expect("open in-memory sqlite")),
        ),
    ]
}

fn category(id: &str, name: &str) -> RewardCategory {
    RewardCategory::new(id, name, None, "#336699", "star", false).expect("valid category")
}

fn seed_category(store: &dyn LedgerStore) {
    store
        .add_category(USER, category("cat-1", "Chores"))
        .expect("seed category");
}

fn entry(store: &dyn LedgerStore, clock: &ManualClock, id: &str, points: i64) -> RewardEntry {
    let e = RewardEntry::new(id, USER, points, "chore", "cat-1", EntryType::Earned, clock.now())
        .expect("valid entry");
    store.add_entry(e).expect("add entry")
}

#[test]
fn test_entry_crud_and_totals() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        seed_category(store.as_ref());
        entry(store.as_ref(), &clock, "e-1", 50);
        entry(store.as_ref(), &clock, "e-2", -20);

        assert_eq!(store.total_points(USER).unwrap(), 30, "{name}");
        assert_eq!(store.total_points("other").unwrap(), 0, "{name}");

        let fetched = store.get_entry(USER, "e-1").unwrap().expect("entry exists");
        assert_eq!(fetched.points, 50, "{name}");
        assert!(!fetched.is_synced, "{name}");

        let updated = fetched
            .update(
                EntryPatch {
                    points: Some(75),
                    ..Default::default()
                },
                clock.now(),
            )
            .unwrap();
        store.update_entry(updated).expect("update entry");
        assert_eq!(store.total_points(USER).unwrap(), 55, "{name}");

        store.delete_entry("e-2", USER).expect("delete entry");
        assert_eq!(store.total_points(USER).unwrap(), 75, "{name}");
        assert!(store.get_entry(USER, "e-2").unwrap().is_none(), "{name}");
    }
}

#[test]
fn test_add_entry_requires_existing_category() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        let e = RewardEntry::new("e-1", USER, 10, "x", "missing", EntryType::Earned, clock.now())
            .unwrap();
        let err = store.add_entry(e).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)), "{name}: {err}");
    }
}

#[test]
fn test_delete_requires_ownership() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        seed_category(store.as_ref());
        entry(store.as_ref(), &clock, "e-1", 10);

        let err = store.delete_entry("e-1", "intruder").unwrap_err();
        assert!(matches!(err, LedgerError::Authorization(_)), "{name}: {err}");
        assert!(store.get_entry(USER, "e-1").unwrap().is_some(), "{name}");

        let err = store.delete_entry("nope", USER).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)), "{name}: {err}");
    }
}

#[test]
fn test_update_entry_enforces_edit_window_at_boundary() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        seed_category(store.as_ref());
        let stored = entry(store.as_ref(), &clock, "e-1", 10);

        clock.advance(Duration::hours(25));
        let mut stale = stored.clone();
        stale.points = 99;
        let err = store.update_entry(stale).unwrap_err();
        assert!(err.to_string().contains("BR-004"), "{name}: {err}");
        assert_eq!(
            store.get_entry(USER, "e-1").unwrap().unwrap().points,
            10,
            "{name}"
        );
        clock.set(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap());
    }
}

#[test]
fn test_history_pagination_and_filters() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        seed_category(store.as_ref());
        store
            .add_category(USER, category("cat-2", "Homework"))
            .unwrap();
        let start = clock.now();
        for i in 0..5 {
            let cat = if i % 2 == 0 { "cat-1" } else { "cat-2" };
            let e = RewardEntry::new(
                format!("e-{i}"),
                USER,
                10,
                "x",
                cat,
                if i == 4 { EntryType::Bonus } else { EntryType::Earned },
                clock.now(),
            )
            .unwrap();
            store.add_entry(e).unwrap();
            clock.advance(Duration::minutes(10));
        }

        let page1 = store
            .history(
                USER,
                &HistoryFilter {
                    page: 1,
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page1.total, 5, "{name}");
        assert_eq!(page1.items.len(), 2, "{name}");
        // newest first
        assert_eq!(page1.items[0].id, "e-4", "{name}");
        assert!(page1.has_more(), "{name}");

        let page3 = store
            .history(
                USER,
                &HistoryFilter {
                    page: 3,
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page3.items.len(), 1, "{name}");
        assert!(!page3.has_more(), "{name}");

        let by_category = store
            .history(
                USER,
                &HistoryFilter {
                    category_id: Some("cat-2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_category.total, 2, "{name}");

        let by_type = store
            .history(
                USER,
                &HistoryFilter {
                    entry_type: Some(EntryType::Bonus),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_type.total, 1, "{name}");

        let windowed = store
            .history(
                USER,
                &HistoryFilter {
                    date_range: Some(DateRange {
                        from: Some(start + Duration::minutes(15)),
                        to: None,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(windowed.total, 3, "{name}");

        clock.set(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap());
    }
}

#[test]
fn test_custom_category_cap_br014() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        for i in 0..MAX_CUSTOM_CATEGORIES {
            store
                .add_category(USER, category(&format!("c-{i}"), &format!("Cat {i}")))
                .expect("under the cap");
        }
        let err = store
            .add_category(USER, category("c-over", "Too many"))
            .unwrap_err();
        assert!(err.to_string().contains("BR-014"), "{name}: {err}");

        // defaults are exempt from the cap, other users unaffected
        let default_cat =
            RewardCategory::new("c-def", "General", None, "#000000", "dot", true).unwrap();
        store.add_category(USER, default_cat).expect("default is exempt");
        store
            .add_category("user-2", category("c-0", "Theirs"))
            .expect("cap is per user");
    }
}

#[test]
fn test_watch_total_points_delivers_and_stops() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        seed_category(store.as_ref());
        let watch = store.watch_total_points(USER).unwrap();
        assert_eq!(watch.try_recv(), Some(0), "{name}: initial snapshot");

        entry(store.as_ref(), &clock, "e-1", 40);
        assert_eq!(
            watch.recv_timeout(StdDuration::from_millis(100)),
            Some(40),
            "{name}"
        );

        store.delete_entry("e-1", USER).unwrap();
        assert_eq!(
            watch.recv_timeout(StdDuration::from_millis(100)),
            Some(0),
            "{name}"
        );

        watch.unsubscribe();
        entry(store.as_ref(), &clock, "e-2", 10);
        // a fresh subscription still works after the old one is gone
        let second = store.watch_total_points(USER).unwrap();
        assert_eq!(second.try_recv(), Some(10), "{name}");
    }
}

#[test]
fn test_apply_remote_leaves_dirty_records_pending() {
    let clock = manual_clock();
    for (name, store) in backends(clock.clone()) {
        seed_category(store.as_ref());
        let local = entry(store.as_ref(), &clock, "e-1", 50);
        let key = RecordKey::new(USER, RecordKind::Entry, "e-1");

        let mut remote_copy = local.clone();
        remote_copy.points = 99;
        let change = RemoteChange {
            key: key.clone(),
            record: Some(LedgerRecord::Entry(remote_copy)),
            version: 1,
            changed_at: clock.now(),
        };

        // the local copy has an unacknowledged edit; neither an overwrite
        // nor a deletion may displace it
        assert!(!store.apply_remote(&change).unwrap(), "{name}");
        let deletion = RemoteChange {
            key: key.clone(),
            record: None,
            version: 1,
            changed_at: clock.now(),
        };
        assert!(!store.apply_remote(&deletion).unwrap(), "{name}");
        let kept = store.get_entry(USER, "e-1").unwrap().expect("still present");
        assert_eq!(kept.points, 50, "{name}");
        assert!(!kept.is_synced, "{name}");

        // once acknowledged, the remote copy applies
        store.mark_synced(&key, 1).unwrap();
        let newer = RemoteChange {
            version: 2,
            ..change
        };
        assert!(store.apply_remote(&newer).unwrap(), "{name}");
        assert_eq!(
            store.get_entry(USER, "e-1").unwrap().unwrap().points,
            99,
            "{name}"
        );
    }
}

#[test]
fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rewards.db");
    let clock = manual_clock();

    {
        let store = SqliteStore::open(&path, clock.clone()).expect("open");
        seed_category(&store);
        entry(&store, &clock, "e-1", 123);
    }

    let store = SqliteStore::open(&path, clock).expect("reopen");
    assert_eq!(store.total_points(USER).unwrap(), 123);
    let cats = store.list_categories(USER).unwrap();
    assert_eq!(cats.len(), 1);
    assert_eq!(cats[0].name, "Chores");
}
