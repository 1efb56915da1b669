//! End-to-end sync passes against the in-memory remote.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};

use rewards_core::clock::ManualClock;
use rewards_core::error::LedgerError;
use rewards_core::model::{EntryPatch, EntryType, RewardCategory, RewardEntry};
use rewards_core::storage::{LedgerRecord, RecordKey, RecordKind};
use rewards_core::{
    CancelToken, Clock, InMemoryRemote, LedgerStore, MemoryStore, RemoteStore, SqliteStore,
    SyncEngine,
};

const USER: &str = "user-1";

struct Harness {
    clock: Arc<ManualClock>,
    local: Arc<dyn LedgerStore>,
    remote: Arc<InMemoryRemote>,
    engine: SyncEngine,
}

fn harness() -> Harness {
    harness_with(|clock| Arc::new(MemoryStore::new(clock)))
}

fn harness_with<F>(make_local: F) -> Harness
where
    F: FnOnce(Arc<ManualClock>) -> Arc<dyn LedgerStore>,
{
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
    ));
    let local = make_local(clock.clone());
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let engine = SyncEngine::new(local.clone(), remote.clone(), clock.clone());
    Harness {
        clock,
        local,
        remote,
        engine,
    }
}

fn category(id: &str) -> RewardCategory {
    RewardCategory::new(id, "Chores", None, "#336699", "star", false).expect("valid category")
}

fn entry(clock: &ManualClock, id: &str, points: i64) -> RewardEntry {
    RewardEntry::new(id, USER, points, "chore", "cat-1", EntryType::Earned, clock.now())
        .expect("valid entry")
}

fn entry_key(id: &str) -> RecordKey {
    RecordKey::new(USER, RecordKind::Entry, id)
}

/// Seed one category and one entry locally and push them up.
fn seeded(h: &Harness) {
    h.local.add_category(USER, category("cat-1")).expect("seed category");
    h.local.add_entry(entry(&h.clock, "e-1", 50)).expect("seed entry");
    let result = h.engine.sync(USER, &CancelToken::new()).expect("initial sync");
    assert_eq!(result.uploaded_count, 2);
    assert!(!result.has_conflicts());
}

#[test]
fn test_upload_marks_records_synced() {
    for h in [
        harness(),
        harness_with(|clock| {
            Arc::new(SqliteStore::open_in_memory(clock).expect("open in-memory sqlite"))
        }),
    ] {
        seeded(&h);

        let stored = h.local.get_entry(USER, "e-1").unwrap().expect("entry");
        assert!(stored.is_synced);
        assert!(h.local.pending_changes(USER).unwrap().is_empty());

        let remote = h.remote.get(&entry_key("e-1")).unwrap().expect("uploaded");
        assert_eq!(remote.version, 1);
        match remote.record {
            Some(LedgerRecord::Entry(e)) => {
                assert_eq!(e.id, stored.id);
                assert_eq!(e.points, stored.points);
            }
            other => panic!("unexpected remote record: {other:?}"),
        }
    }
}

#[test]
fn test_second_pass_is_a_no_op() {
    let h = harness();
    seeded(&h);

    let result = h.engine.sync(USER, &CancelToken::new()).expect("second sync");
    assert_eq!(result.uploaded_count, 0);
    assert_eq!(result.downloaded_count, 0);
    assert!(!result.has_conflicts());
}

#[test]
fn test_downloads_remote_changes_and_advances_checkpoint() {
    let h = harness();
    seeded(&h);

    h.clock.advance(Duration::minutes(5));
    let from_other_device = entry(&h.clock, "e-2", 30);
    h.remote
        .put_unchecked(LedgerRecord::Entry(from_other_device))
        .expect("other device write");
    let remote_changed_at = h.clock.now();

    h.clock.advance(Duration::minutes(5));
    let result = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert_eq!(result.downloaded_count, 1);

    let pulled = h.local.get_entry(USER, "e-2").unwrap().expect("downloaded");
    assert!(pulled.is_synced);
    assert_eq!(h.local.total_points(USER).unwrap(), 80);
    // checkpoint is the newest pulled change, not the wall clock
    assert_eq!(h.local.sync_checkpoint(USER).unwrap(), Some(remote_changed_at));
}

#[test]
fn test_change_written_at_checkpoint_instant_is_still_pulled() {
    let h = harness();
    seeded(&h);

    // another device writes in the same instant the checkpoint points at,
    // after this device's pull
    h.remote
        .put_unchecked(LedgerRecord::Entry(entry(&h.clock, "e-2", 30)))
        .expect("other device write");

    let result = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert_eq!(result.downloaded_count, 1);
    assert!(h.local.get_entry(USER, "e-2").unwrap().is_some());

    // re-pulling the boundary instant stays idempotent
    let again = h.engine.sync(USER, &CancelToken::new()).expect("resync");
    assert_eq!(again.downloaded_count, 0);
}

#[test]
fn test_local_delete_uploads_tombstone() {
    let h = harness();
    seeded(&h);

    h.local.delete_entry("e-1", USER).expect("delete");
    let result = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert_eq!(result.uploaded_count, 1);

    let remote = h.remote.get(&entry_key("e-1")).unwrap().expect("deletion marker");
    assert!(remote.record.is_none());
    assert_eq!(remote.version, 2);
    assert!(h.local.pending_changes(USER).unwrap().is_empty());
}

#[test]
fn test_remote_deletion_applies_locally() {
    let h = harness();
    seeded(&h);

    h.clock.advance(Duration::minutes(5));
    h.remote
        .delete(&entry_key("e-1"), Some(1))
        .expect("other device delete");

    let result = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert_eq!(result.downloaded_count, 1);
    assert!(h.local.get_entry(USER, "e-1").unwrap().is_none());
    assert_eq!(h.local.total_points(USER).unwrap(), 0);
}

#[test]
fn test_concurrent_edit_is_reported_not_raised() {
    let h = harness();
    seeded(&h);

    // another device edits e-1 to v2 while we edit it locally against v1
    h.clock.advance(Duration::minutes(5));
    let mut theirs = h.local.get_entry(USER, "e-1").unwrap().unwrap();
    theirs.points = 70;
    h.remote
        .put_unchecked(LedgerRecord::Entry(theirs))
        .expect("other device write");
    let remote_changed_at = h.clock.now();

    let ours = h
        .local
        .get_entry(USER, "e-1")
        .unwrap()
        .unwrap()
        .update(
            EntryPatch {
                points: Some(60),
                ..Default::default()
            },
            h.clock.now(),
        )
        .unwrap();
    h.local.update_entry(ours).expect("local edit");

    h.clock.advance(Duration::minutes(5));
    let result = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert_eq!(result.uploaded_count, 0);
    assert_eq!(result.conflicted_entries, vec![entry_key("e-1")]);

    // neither side is overwritten; the local edit stays pending
    let local = h.local.get_entry(USER, "e-1").unwrap().unwrap();
    assert_eq!(local.points, 60);
    assert!(!local.is_synced);
    assert_eq!(h.remote.get(&entry_key("e-1")).unwrap().unwrap().version, 2);

    // conflicts do not hold the checkpoint back
    assert_eq!(h.local.sync_checkpoint(USER).unwrap(), Some(remote_changed_at));
}

#[test]
fn test_keep_local_overwrites_remote_on_next_pass() {
    let h = harness();
    seeded(&h);

    h.clock.advance(Duration::minutes(5));
    let mut theirs = h.local.get_entry(USER, "e-1").unwrap().unwrap();
    theirs.points = 70;
    h.remote.put_unchecked(LedgerRecord::Entry(theirs)).unwrap();
    let ours = h
        .local
        .get_entry(USER, "e-1")
        .unwrap()
        .unwrap()
        .update(
            EntryPatch {
                points: Some(60),
                ..Default::default()
            },
            h.clock.now(),
        )
        .unwrap();
    h.local.update_entry(ours).unwrap();

    let first = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert!(first.has_conflicts());

    h.engine.keep_local(&entry_key("e-1")).expect("keep local");
    let second = h.engine.sync(USER, &CancelToken::new()).expect("resync");
    assert_eq!(second.uploaded_count, 1);
    assert!(!second.has_conflicts());

    let remote = h.remote.get(&entry_key("e-1")).unwrap().unwrap();
    assert_eq!(remote.version, 3);
    match remote.record {
        Some(LedgerRecord::Entry(e)) => assert_eq!(e.points, 60),
        other => panic!("unexpected remote record: {other:?}"),
    }
}

#[test]
fn test_adopt_remote_discards_local_edit() {
    let h = harness();
    seeded(&h);

    h.clock.advance(Duration::minutes(5));
    let mut theirs = h.local.get_entry(USER, "e-1").unwrap().unwrap();
    theirs.points = 70;
    h.remote.put_unchecked(LedgerRecord::Entry(theirs)).unwrap();
    let ours = h
        .local
        .get_entry(USER, "e-1")
        .unwrap()
        .unwrap()
        .update(
            EntryPatch {
                points: Some(60),
                ..Default::default()
            },
            h.clock.now(),
        )
        .unwrap();
    h.local.update_entry(ours).unwrap();

    let first = h.engine.sync(USER, &CancelToken::new()).expect("sync");
    assert!(first.has_conflicts());

    h.engine.adopt_remote(&entry_key("e-1")).expect("adopt remote");
    let local = h.local.get_entry(USER, "e-1").unwrap().unwrap();
    assert_eq!(local.points, 70);
    assert!(local.is_synced);
    assert!(h.local.pending_changes(USER).unwrap().is_empty());

    let second = h.engine.sync(USER, &CancelToken::new()).expect("resync");
    assert_eq!(second.uploaded_count, 0);
    assert!(!second.has_conflicts());
}

#[test]
fn test_transport_failure_leaves_checkpoint_and_pending_untouched() {
    let h = harness();
    seeded(&h);
    let checkpoint = h.local.sync_checkpoint(USER).unwrap();

    h.clock.advance(Duration::minutes(5));
    let edited = h
        .local
        .get_entry(USER, "e-1")
        .unwrap()
        .unwrap()
        .update(
            EntryPatch {
                points: Some(60),
                ..Default::default()
            },
            h.clock.now(),
        )
        .unwrap();
    h.local.update_entry(edited).unwrap();

    h.remote.fail_requests(true);
    let err = h.engine.sync(USER, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, LedgerError::Transport(_)), "{err}");

    assert_eq!(h.local.sync_checkpoint(USER).unwrap(), checkpoint);
    assert_eq!(h.local.pending_changes(USER).unwrap().len(), 1);

    h.remote.fail_requests(false);
    let result = h.engine.sync(USER, &CancelToken::new()).expect("retry");
    assert_eq!(result.uploaded_count, 1);
}

#[test]
fn test_cancellation_aborts_before_remote_calls() {
    let h = harness();
    h.local.add_category(USER, category("cat-1")).unwrap();

    let token = CancelToken::new();
    token.cancel();
    let err = h.engine.sync(USER, &token).unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled(_)), "{err}");

    let expired = CancelToken::with_timeout(StdDuration::from_millis(0));
    std::thread::sleep(StdDuration::from_millis(5));
    let err = h.engine.sync(USER, &expired).unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled(_)), "{err}");

    // nothing reached the remote
    assert!(h
        .remote
        .get(&RecordKey::new(USER, RecordKind::Category, "cat-1"))
        .unwrap()
        .is_none());
}

#[test]
fn test_passes_for_one_user_serialize() {
    let h = harness();
    seeded(&h);
    let engine = Arc::new(h.engine);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || engine.sync(USER, &CancelToken::new()))
        })
        .collect();
    for handle in handles {
        let result = handle.join().expect("thread").expect("sync");
        assert!(!result.has_conflicts());
    }
}
