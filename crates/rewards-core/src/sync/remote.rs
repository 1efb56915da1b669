//! Remote store port and the in-memory reference implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::storage::{LedgerRecord, RecordKey, RemoteChange};

/// Outcome of a conditional remote write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write was stored; `version` is the record's new remote version.
    Stored { version: u64 },
    /// The record changed since the version the caller last observed.
    Conflict { current_version: Option<u64> },
}

/// Opaque keyed document store reachable over a network.
///
/// Writes are conditional: `expected_version` is the version the caller
/// last observed (`None` for "the remote has never seen this record").
/// A mismatch yields [`PutOutcome::Conflict`] rather than overwriting.
/// Infrastructure problems surface as `LedgerError::Transport`.
pub trait RemoteStore: Send + Sync {
    fn get(&self, key: &RecordKey) -> Result<Option<RemoteChange>>;

    fn put(&self, record: &LedgerRecord, expected_version: Option<u64>) -> Result<PutOutcome>;

    fn delete(&self, key: &RecordKey, expected_version: Option<u64>) -> Result<PutOutcome>;

    /// Records (and deletions) of `user_id` changed at or after `since`.
    ///
    /// The bound is inclusive so a write that lands in the same instant as
    /// a caller's checkpoint is still visible to the next pass; callers
    /// dedupe re-pulled records by version.
    fn changes_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>>;
}

struct StoredRecord {
    /// `None` is a remote deletion marker
    record: Option<LedgerRecord>,
    version: u64,
    changed_at: DateTime<Utc>,
}

/// In-memory [`RemoteStore`] with per-record version counters.
///
/// Serves as the test double for the sync engine; `fail_requests` simulates
/// an unreachable backend.
pub struct InMemoryRemote {
    records: Mutex<HashMap<RecordKey, StoredRecord>>,
    clock: Arc<dyn Clock>,
    failing: AtomicBool,
}

impl InMemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with a transport error (or stop).
    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write bypassing the version check, as another device would.
    ///
    /// Returns the record's new version.
    pub fn put_unchecked(&self, record: LedgerRecord) -> Result<u64> {
        let mut records = self.lock()?;
        let key = record.key();
        let version = records.get(&key).map(|r| r.version).unwrap_or(0) + 1;
        records.insert(
            key,
            StoredRecord {
                record: Some(record),
                version,
                changed_at: self.clock.now(),
            },
        );
        Ok(version)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RecordKey, StoredRecord>>> {
        self.records
            .lock()
            .map_err(|_| LedgerError::Storage("remote store lock poisoned".to_string()))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport(
                "remote store unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

impl RemoteStore for InMemoryRemote {
    fn get(&self, key: &RecordKey) -> Result<Option<RemoteChange>> {
        self.check_reachable()?;
        let records = self.lock()?;
        Ok(records.get(key).map(|stored| RemoteChange {
            key: key.clone(),
            record: stored.record.clone(),
            version: stored.version,
            changed_at: stored.changed_at,
        }))
    }

    fn put(&self, record: &LedgerRecord, expected_version: Option<u64>) -> Result<PutOutcome> {
        self.check_reachable()?;
        let mut records = self.lock()?;
        let key = record.key();
        let current = records.get(&key).map(|r| r.version);
        if current != expected_version {
            return Ok(PutOutcome::Conflict {
                current_version: current,
            });
        }
        let version = current.unwrap_or(0) + 1;
        records.insert(
            key,
            StoredRecord {
                record: Some(record.clone()),
                version,
                changed_at: self.clock.now(),
            },
        );
        Ok(PutOutcome::Stored { version })
    }

    fn delete(&self, key: &RecordKey, expected_version: Option<u64>) -> Result<PutOutcome> {
        self.check_reachable()?;
        let mut records = self.lock()?;
        let current = match records.get(key) {
            // Already gone (or never seen): the delete is a no-op success.
            None => return Ok(PutOutcome::Stored { version: 0 }),
            Some(stored) if stored.record.is_none() => {
                return Ok(PutOutcome::Stored {
                    version: stored.version,
                })
            }
            Some(stored) => stored.version,
        };
        if expected_version != Some(current) {
            return Ok(PutOutcome::Conflict {
                current_version: Some(current),
            });
        }
        let version = current + 1;
        records.insert(
            key.clone(),
            StoredRecord {
                record: None,
                version,
                changed_at: self.clock.now(),
            },
        );
        Ok(PutOutcome::Stored { version })
    }

    fn changes_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>> {
        self.check_reachable()?;
        let records = self.lock()?;
        let mut changes: Vec<RemoteChange> = records
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .filter(|(_, stored)| since.map_or(true, |since| stored.changed_at >= since))
            .map(|(key, stored)| RemoteChange {
                key: key.clone(),
                record: stored.record.clone(),
                version: stored.version,
                changed_at: stored.changed_at,
            })
            .collect();
        changes.sort_by(|a, b| a.changed_at.cmp(&b.changed_at).then(a.key.cmp(&b.key)));
        Ok(changes)
    }
}
