//! File-backed remote store.
//!
//! A `RemoteStore` over a single JSON document, suitable for syncing through
//! a shared folder (network drive, file-sync service). Every call reloads the
//! file and every mutation rewrites it, so passes from several machines
//! interleave safely at record granularity via the version checks.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rewards_core::error::{LedgerError, Result};
use rewards_core::storage::{LedgerRecord, RecordKey, RemoteChange};
use rewards_core::sync::PutOutcome;
use rewards_core::RemoteStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    key: RecordKey,
    /// `None` is a deletion marker
    record: Option<LedgerRecord>,
    version: u64,
    changed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteFile {
    records: Vec<StoredRecord>,
}

/// [`RemoteStore`] persisted as one JSON file.
pub struct JsonFileRemote {
    path: PathBuf,
}

impl JsonFileRemote {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<RemoteFile> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                LedgerError::Transport(format!(
                    "remote file {} is not valid JSON: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RemoteFile::default()),
            Err(e) => Err(LedgerError::Transport(format!(
                "cannot read remote file {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, file: &RemoteFile) -> Result<()> {
        let json = serde_json::to_vec_pretty(file)
            .map_err(|e| LedgerError::Transport(format!("cannot encode remote file: {e}")))?;
        // write-then-rename so a crashed pass never leaves a torn file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| {
            LedgerError::Transport(format!("cannot write remote file {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            LedgerError::Transport(format!(
                "cannot replace remote file {}: {e}",
                self.path.display()
            ))
        })
    }
}

impl RemoteStore for JsonFileRemote {
    fn get(&self, key: &RecordKey) -> Result<Option<RemoteChange>> {
        let file = self.load()?;
        Ok(file
            .records
            .iter()
            .find(|stored| &stored.key == key)
            .map(|stored| RemoteChange {
                key: stored.key.clone(),
                record: stored.record.clone(),
                version: stored.version,
                changed_at: stored.changed_at,
            }))
    }

    fn put(&self, record: &LedgerRecord, expected_version: Option<u64>) -> Result<PutOutcome> {
        let mut file = self.load()?;
        let key = record.key();
        let slot = file.records.iter_mut().find(|stored| stored.key == key);
        let current = slot.as_ref().map(|stored| stored.version);
        if current != expected_version {
            return Ok(PutOutcome::Conflict {
                current_version: current,
            });
        }
        let version = current.unwrap_or(0) + 1;
        let next = StoredRecord {
            key,
            record: Some(record.clone()),
            version,
            changed_at: Utc::now(),
        };
        match slot {
            Some(stored) => *stored = next,
            None => file.records.push(next),
        }
        self.save(&file)?;
        Ok(PutOutcome::Stored { version })
    }

    fn delete(&self, key: &RecordKey, expected_version: Option<u64>) -> Result<PutOutcome> {
        let mut file = self.load()?;
        let slot = file.records.iter_mut().find(|stored| &stored.key == key);
        let current = match &slot {
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
        if let Some(stored) = slot {
            stored.record = None;
            stored.version = version;
            stored.changed_at = Utc::now();
        }
        self.save(&file)?;
        Ok(PutOutcome::Stored { version })
    }

    fn changes_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteChange>> {
        let file = self.load()?;
        let mut changes: Vec<RemoteChange> = file
            .records
            .into_iter()
            .filter(|stored| stored.key.user_id == user_id)
            .filter(|stored| since.map_or(true, |since| stored.changed_at >= since))
            .map(|stored| RemoteChange {
                key: stored.key,
                record: stored.record,
                version: stored.version,
                changed_at: stored.changed_at,
            })
            .collect();
        changes.sort_by(|a, b| a.changed_at.cmp(&b.changed_at).then(a.key.cmp(&b.key)));
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rewards_core::model::{EntryType, RewardEntry};

    fn sample_record() -> LedgerRecord {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        LedgerRecord::Entry(
            RewardEntry::new("e-1", "user-1", 10, "chore", "cat-1", EntryType::Earned, created)
                .expect("valid entry"),
        )
    }

    #[test]
    fn test_put_get_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = JsonFileRemote::new(dir.path().join("remote.json"));

        let record = sample_record();
        let outcome = remote.put(&record, None).expect("put");
        assert_eq!(outcome, PutOutcome::Stored { version: 1 });

        let fetched = remote.get(&record.key()).expect("get").expect("present");
        assert_eq!(fetched.record, Some(record));
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = JsonFileRemote::new(dir.path().join("remote.json"));

        let record = sample_record();
        remote.put(&record, None).expect("put");
        remote.put(&record, Some(1)).expect("second put");

        let outcome = remote.put(&record, Some(1)).expect("stale put");
        assert_eq!(
            outcome,
            PutOutcome::Conflict {
                current_version: Some(2)
            }
        );
    }

    #[test]
    fn test_delete_of_missing_record_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = JsonFileRemote::new(dir.path().join("remote.json"));
        let outcome = remote
            .delete(&sample_record().key(), None)
            .expect("delete");
        assert_eq!(outcome, PutOutcome::Stored { version: 0 });
    }

    #[test]
    fn test_changes_since_filters_by_user_and_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let remote = JsonFileRemote::new(dir.path().join("remote.json"));
        remote.put(&sample_record(), None).expect("put");

        let all = remote.changes_since("user-1", None).expect("changes");
        assert_eq!(all.len(), 1);
        // a bound equal to the change's own instant still includes it
        let at_instant = remote
            .changes_since("user-1", Some(all[0].changed_at))
            .expect("changes");
        assert_eq!(at_instant.len(), 1);
        let other = remote.changes_since("user-2", None).expect("changes");
        assert!(other.is_empty());
        let future = remote
            .changes_since("user-1", Some(Utc::now() + chrono::Duration::hours(1)))
            .expect("changes");
        assert!(future.is_empty());
    }
}
