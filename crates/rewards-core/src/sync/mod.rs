//! Offline-first reconciliation between a local store and a remote store.
//!
//! A sync pass uploads locally-pending changes with conditional writes,
//! pulls remote changes since the last checkpoint, and reports conflicts
//! instead of overwriting either side. Transport failures abort the pass
//! and leave the checkpoint unmoved; retrying is the caller's policy.

mod remote;

pub use remote::{InMemoryRemote, PutOutcome, RemoteStore};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::storage::{LedgerStore, RecordKey};

/// Cooperative cancellation for a sync pass.
///
/// Checked before every remote call; an expired deadline counts as
/// cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that cancels itself after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub uploaded_count: u64,
    pub downloaded_count: u64,
    /// Records whose remote copy changed since the local copy last
    /// observed it; ordered by key. These stay pending until the caller
    /// resolves them.
    pub conflicted_entries: Vec<RecordKey>,
    pub sync_timestamp: DateTime<Utc>,
}

impl SyncResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicted_entries.is_empty()
    }
}

/// Reconciles a local pending-change queue with a remote store.
pub struct SyncEngine {
    local: Arc<dyn LedgerStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    /// Per-user advisory locks; passes for the same user serialize.
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        local: Arc<dyn LedgerStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local,
            remote,
            clock,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .user_locks
            .lock()
            .map_err(|_| LedgerError::Storage("sync lock table poisoned".to_string()))?;
        Ok(Arc::clone(
            locks.entry(user_id.to_string()).or_default(),
        ))
    }

    fn ensure_active(cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled(
                "sync pass cancelled before completion".to_string(),
            ));
        }
        Ok(())
    }

    /// Run one sync pass for `user_id`.
    ///
    /// Conflicts are reported in the result, never raised as errors.
    /// Transport failures and cancellation abort the pass with the local
    /// checkpoint untouched.
    pub fn sync(&self, user_id: &str, cancel: &CancelToken) -> Result<SyncResult> {
        let user_lock = self.user_lock(user_id)?;
        let _guard = user_lock
            .lock()
            .map_err(|_| LedgerError::Storage("per-user sync lock poisoned".to_string()))?;

        Self::ensure_active(cancel)?;
        let pending = self.local.pending_changes(user_id)?;
        debug!("sync {user_id}: {} pending changes", pending.len());

        let mut uploaded_count = 0u64;
        let mut conflicted_entries: Vec<RecordKey> = Vec::new();

        for change in &pending {
            Self::ensure_active(cancel)?;
            let outcome = match &change.record {
                Some(record) => self.remote.put(record, change.base_version)?,
                None => self.remote.delete(&change.key, change.base_version)?,
            };
            match outcome {
                PutOutcome::Stored { version } => {
                    if change.record.is_some() {
                        self.local.mark_synced(&change.key, version)?;
                    } else {
                        self.local.clear_tombstone(&change.key)?;
                    }
                    uploaded_count += 1;
                }
                PutOutcome::Conflict { current_version } => {
                    debug!(
                        "sync {user_id}: conflict on {} (remote v{:?})",
                        change.key, current_version
                    );
                    conflicted_entries.push(change.key.clone());
                }
            }
        }

        Self::ensure_active(cancel)?;
        let checkpoint = self.local.sync_checkpoint(user_id)?;
        let changes = self.remote.changes_since(user_id, checkpoint)?;

        let blocked: HashSet<&RecordKey> = conflicted_entries.iter().collect();
        let mut downloaded_count = 0u64;
        let mut newest = checkpoint;
        for change in &changes {
            newest = Some(newest.map_or(change.changed_at, |n| n.max(change.changed_at)));
            if blocked.contains(&change.key) {
                continue;
            }
            // Skip our own uploads echoed back, and anything older than
            // what we already hold.
            if let Some(known) = self.local.remote_version(&change.key)? {
                if known >= change.version {
                    continue;
                }
            }
            if self.local.apply_remote(change)? {
                downloaded_count += 1;
            }
        }

        // The pass finished without a transport failure; conflicts do not
        // block checkpoint advancement.
        if let Some(newest) = newest {
            self.local.set_sync_checkpoint(user_id, newest)?;
        }

        conflicted_entries.sort();
        let result = SyncResult {
            uploaded_count,
            downloaded_count,
            conflicted_entries,
            sync_timestamp: self.clock.now(),
        };
        info!(
            "sync {user_id}: uploaded={} downloaded={} conflicts={}",
            result.uploaded_count,
            result.downloaded_count,
            result.conflicted_entries.len()
        );
        Ok(result)
    }

    /// Resolve a conflict by discarding the local change and adopting the
    /// remote copy.
    pub fn adopt_remote(&self, key: &RecordKey) -> Result<()> {
        match self.remote.get(key)? {
            Some(change) => {
                self.local.clear_tombstone(key)?;
                // settle the pending state first; stores refuse to overwrite
                // a still-dirty record
                self.local.mark_synced(key, change.version)?;
                self.local.apply_remote(&change).map(|_| ())
            }
            None => Err(LedgerError::NotFound(format!("remote record {key}"))),
        }
    }

    /// Resolve a conflict by keeping the local change: rebase it onto the
    /// current remote version so the next pass overwrites the remote copy.
    pub fn keep_local(&self, key: &RecordKey) -> Result<()> {
        let current = self.remote.get(key)?.map(|change| change.version);
        self.local.rebase_pending(key, current)
    }
}
