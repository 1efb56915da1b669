//! Ledger store trait definition.
//!
//! The `LedgerStore` trait is the contract a persistence backend must
//! satisfy. This abstraction keeps the batch executor, the sync engine, and
//! every caller independent of the concrete backend (in-memory, SQLite, or
//! a test double).

use chrono::{DateTime, Utc};

use super::types::{
    BatchOperation, HistoryFilter, HistoryPage, LedgerRecord, PendingChange, RecordKey,
    RemoteChange,
};
use super::watch::TotalPointsWatch;
use crate::error::{LedgerError, Result};
use crate::model::{RedemptionStats, RedemptionTransaction, RewardCategory, RewardEntry};

/// Per-user cap on custom (non-default) categories (BR-014).
pub const MAX_CUSTOM_CATEGORIES: usize = 20;

/// Storage interface for the points ledger.
///
/// All implementations must ensure:
/// - Mutations are safe to invoke concurrently from multiple threads
/// - Aggregate totals are only changed through committed mutations
/// - Locally unacknowledged changes are tracked for the sync engine
///
/// The point total of a user is the sum of that user's entry points;
/// redemption spending reaches the total through compensating entries
/// created by the caller.
pub trait LedgerStore: Send + Sync {
    // --- Reward entries ---

    /// Insert a new entry.
    ///
    /// # Errors
    ///
    /// - `LedgerError::NotFound` if the referenced category does not exist
    /// - `LedgerError::Storage` if the entry id is already taken
    fn add_entry(&self, entry: RewardEntry) -> Result<RewardEntry>;

    /// Get an entry by id, scoped to its owner.
    fn get_entry(&self, user_id: &str, entry_id: &str) -> Result<Option<RewardEntry>>;

    /// Replace an existing entry.
    ///
    /// Re-validates the 24h edit window (BR-004) against the *stored*
    /// creation time, using the store's clock. The stored creation time is
    /// authoritative and cannot be changed by the update.
    fn update_entry(&self, entry: RewardEntry) -> Result<RewardEntry>;

    /// Delete an entry.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Authorization` if `requesting_user_id` does not own
    ///   the entry
    /// - `LedgerError::NotFound` if no such entry exists
    fn delete_entry(&self, entry_id: &str, requesting_user_id: &str) -> Result<()>;

    /// Paginated entry history for a user, newest first.
    fn history(&self, user_id: &str, filter: &HistoryFilter) -> Result<HistoryPage<RewardEntry>>;

    /// Current point total for a user.
    fn total_points(&self, user_id: &str) -> Result<i64>;

    /// Subscribe to a user's point total.
    ///
    /// The current total is delivered immediately, then again after every
    /// committed mutation affecting that user. The subscription never
    /// blocks the mutating thread and stops delivering once dropped or
    /// unsubscribed.
    fn watch_total_points(&self, user_id: &str) -> Result<TotalPointsWatch>;

    // --- Categories ---

    /// Insert a category for a user.
    ///
    /// # Errors
    ///
    /// Returns a BR-014 validation error when the user already has
    /// [`MAX_CUSTOM_CATEGORIES`] non-default categories.
    fn add_category(&self, owner_id: &str, category: RewardCategory) -> Result<RewardCategory>;

    /// Replace an existing category.
    fn update_category(&self, owner_id: &str, category: RewardCategory) -> Result<RewardCategory>;

    /// Delete a category.
    fn delete_category(&self, owner_id: &str, category_id: &str) -> Result<()>;

    fn get_category(&self, owner_id: &str, category_id: &str) -> Result<Option<RewardCategory>>;

    /// All categories of a user, defaults first, then by name.
    fn list_categories(&self, owner_id: &str) -> Result<Vec<RewardCategory>>;

    // --- Redemption transactions ---

    /// Insert a redemption transaction.
    fn add_redemption(&self, tx: RedemptionTransaction) -> Result<RedemptionTransaction>;

    /// Replace an existing redemption.
    ///
    /// Status legality is the entity state machine's concern; callers are
    /// expected to produce the new value through `complete`/`cancel`/
    /// `expire`/`copy_with`.
    fn update_redemption(&self, tx: RedemptionTransaction) -> Result<RedemptionTransaction>;

    /// Delete a redemption.
    ///
    /// # Errors
    ///
    /// - `LedgerError::Authorization` if `requesting_user_id` does not own it
    /// - `LedgerError::NotFound` if no such redemption exists
    fn delete_redemption(&self, id: &str, requesting_user_id: &str) -> Result<()>;

    fn get_redemption(&self, user_id: &str, id: &str) -> Result<Option<RedemptionTransaction>>;

    /// All redemptions of a user, newest first.
    fn list_redemptions(&self, user_id: &str) -> Result<Vec<RedemptionTransaction>>;

    /// Aggregate redemption statistics for a user.
    fn redemption_stats(&self, user_id: &str) -> Result<RedemptionStats> {
        Ok(RedemptionStats::from_transactions(
            &self.list_redemptions(user_id)?,
        ))
    }

    // --- Batch support ---

    /// Whether the backend has a native multi-document transaction
    /// primitive. When false, the batch executor drives this store through
    /// its compensating-rollback path instead of [`LedgerStore::apply_batch`].
    fn supports_transactions(&self) -> bool;

    /// Apply a batch inside one native transaction.
    fn apply_batch(&self, ops: &[BatchOperation]) -> Result<Vec<LedgerRecord>> {
        let _ = ops;
        Err(LedgerError::Storage(
            "backend has no native transaction support".to_string(),
        ))
    }

    // --- Sync bookkeeping ---

    /// Locally pending changes for a user, in a deterministic order.
    fn pending_changes(&self, user_id: &str) -> Result<Vec<PendingChange>>;

    /// Record that the remote store acknowledged a record at `version`.
    fn mark_synced(&self, key: &RecordKey, version: u64) -> Result<()>;

    /// Drop the delete tombstone for a record the remote has confirmed gone.
    fn clear_tombstone(&self, key: &RecordKey) -> Result<()>;

    /// Last remote version this store observed for a record.
    fn remote_version(&self, key: &RecordKey) -> Result<Option<u64>>;

    /// Move a still-pending record onto a new remote base version without
    /// clearing its dirty state (conflict resolution: keep local).
    fn rebase_pending(&self, key: &RecordKey, version: Option<u64>) -> Result<()>;

    /// Apply a change pulled from the remote store, without re-dirtying it.
    ///
    /// Returns whether local state actually changed: a remote deletion of a
    /// record this store never held is a no-op, and a record with a local
    /// unacknowledged edit is left untouched so it stays pending.
    fn apply_remote(&self, change: &RemoteChange) -> Result<bool>;

    /// Last successfully reconciled point in time for a user.
    fn sync_checkpoint(&self, user_id: &str) -> Result<Option<DateTime<Utc>>>;

    fn set_sync_checkpoint(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;
}
