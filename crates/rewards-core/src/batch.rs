//! Atomic application of multi-operation batches.
//!
//! A batch either applies completely or leaves no observable change. On a
//! backend with native transactions the whole batch runs inside one store
//! transaction; otherwise the executor applies operations one by one while
//! recording inverse operations, and undoes them in reverse order when a
//! later operation fails. If an undo itself fails, the distinct
//! `PartialApplication` error is surfaced so callers know local state may
//! be inconsistent.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{LedgerError, Result};
use crate::model::{RedemptionTransaction, RewardCategory, RewardEntry};
use crate::storage::{BatchOperation, LedgerRecord, LedgerStore};

/// Applies ordered operation sequences as one atomic unit.
pub struct BatchExecutor {
    store: Arc<dyn LedgerStore>,
}

/// Inverse of one applied operation.
enum UndoOp {
    RemoveEntry { entry_id: String, user_id: String },
    RestoreEntry(RewardEntry),
    ReAddEntry(RewardEntry),
    RemoveCategory { owner_id: String, category_id: String },
    RestoreCategory { owner_id: String, category: RewardCategory },
    ReAddCategory { owner_id: String, category: RewardCategory },
    RemoveRedemption { user_id: String, id: String },
    RestoreRedemption(RedemptionTransaction),
    ReAddRedemption(RedemptionTransaction),
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Apply `ops` atomically.
    ///
    /// Returns the resulting entities of add/update operations in input
    /// order; deletions contribute no output record.
    pub fn apply(&self, ops: &[BatchOperation]) -> Result<Vec<LedgerRecord>> {
        if self.store.supports_transactions() {
            return self.store.apply_batch(ops);
        }
        self.apply_compensating(ops)
    }

    fn apply_compensating(&self, ops: &[BatchOperation]) -> Result<Vec<LedgerRecord>> {
        let mut undo_log: Vec<UndoOp> = Vec::new();
        let mut results = Vec::new();

        for (index, op) in ops.iter().enumerate() {
            match self.apply_one(op) {
                Ok((record, undo)) => {
                    if let Some(record) = record {
                        results.push(record);
                    }
                    if let Some(undo) = undo {
                        undo_log.push(undo);
                    }
                }
                Err(err) => {
                    debug!("batch op {index} failed, rolling back {} ops", undo_log.len());
                    for undo in undo_log.into_iter().rev() {
                        if let Err(rollback_err) = self.undo_one(undo) {
                            warn!("batch rollback failed: {rollback_err}");
                            return Err(LedgerError::PartialApplication(format!(
                                "operation {index} failed ({err}) and rollback failed \
                                 ({rollback_err}); local state may be partially applied"
                            )));
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    fn apply_one(&self, op: &BatchOperation) -> Result<(Option<LedgerRecord>, Option<UndoOp>)> {
        match op {
            BatchOperation::AddEntry(entry) => {
                let stored = self.store.add_entry(entry.clone())?;
                let undo = UndoOp::RemoveEntry {
                    entry_id: stored.id.clone(),
                    user_id: stored.user_id.clone(),
                };
                Ok((Some(LedgerRecord::Entry(stored)), Some(undo)))
            }
            BatchOperation::UpdateEntry(entry) => {
                let previous = self
                    .store
                    .get_entry(&entry.user_id, &entry.id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("entry '{}'", entry.id)))?;
                let stored = self.store.update_entry(entry.clone())?;
                Ok((
                    Some(LedgerRecord::Entry(stored)),
                    Some(UndoOp::RestoreEntry(previous)),
                ))
            }
            BatchOperation::DeleteEntry {
                entry_id,
                requesting_user_id,
            } => {
                let previous = self.store.get_entry(requesting_user_id, entry_id)?;
                self.store.delete_entry(entry_id, requesting_user_id)?;
                Ok((None, previous.map(UndoOp::ReAddEntry)))
            }
            BatchOperation::AddCategory { owner_id, category } => {
                let stored = self.store.add_category(owner_id, category.clone())?;
                let undo = UndoOp::RemoveCategory {
                    owner_id: owner_id.clone(),
                    category_id: stored.id.clone(),
                };
                Ok((
                    Some(LedgerRecord::Category {
                        owner_id: owner_id.clone(),
                        category: stored,
                    }),
                    Some(undo),
                ))
            }
            BatchOperation::UpdateCategory { owner_id, category } => {
                let previous = self
                    .store
                    .get_category(owner_id, &category.id)?
                    .ok_or_else(|| {
                        LedgerError::NotFound(format!("category '{}'", category.id))
                    })?;
                let stored = self.store.update_category(owner_id, category.clone())?;
                Ok((
                    Some(LedgerRecord::Category {
                        owner_id: owner_id.clone(),
                        category: stored,
                    }),
                    Some(UndoOp::RestoreCategory {
                        owner_id: owner_id.clone(),
                        category: previous,
                    }),
                ))
            }
            BatchOperation::DeleteCategory {
                owner_id,
                category_id,
            } => {
                let previous = self.store.get_category(owner_id, category_id)?;
                self.store.delete_category(owner_id, category_id)?;
                Ok((
                    None,
                    previous.map(|category| UndoOp::ReAddCategory {
                        owner_id: owner_id.clone(),
                        category,
                    }),
                ))
            }
            BatchOperation::AddRedemption(tx) => {
                let stored = self.store.add_redemption(tx.clone())?;
                let undo = UndoOp::RemoveRedemption {
                    user_id: stored.user_id.clone(),
                    id: stored.id.clone(),
                };
                Ok((Some(LedgerRecord::Redemption(stored)), Some(undo)))
            }
            BatchOperation::UpdateRedemption(tx) => {
                let previous = self
                    .store
                    .get_redemption(&tx.user_id, &tx.id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("redemption '{}'", tx.id)))?;
                let stored = self.store.update_redemption(tx.clone())?;
                Ok((
                    Some(LedgerRecord::Redemption(stored)),
                    Some(UndoOp::RestoreRedemption(previous)),
                ))
            }
            BatchOperation::DeleteRedemption {
                id,
                requesting_user_id,
            } => {
                let previous = self.store.get_redemption(requesting_user_id, id)?;
                self.store.delete_redemption(id, requesting_user_id)?;
                Ok((None, previous.map(UndoOp::ReAddRedemption)))
            }
        }
    }

    fn undo_one(&self, undo: UndoOp) -> Result<()> {
        match undo {
            UndoOp::RemoveEntry { entry_id, user_id } => {
                self.store.delete_entry(&entry_id, &user_id)
            }
            UndoOp::RestoreEntry(entry) => self.store.update_entry(entry).map(|_| ()),
            UndoOp::ReAddEntry(entry) => self.store.add_entry(entry).map(|_| ()),
            UndoOp::RemoveCategory {
                owner_id,
                category_id,
            } => self.store.delete_category(&owner_id, &category_id),
            UndoOp::RestoreCategory { owner_id, category } => {
                self.store.update_category(&owner_id, category).map(|_| ())
            }
            UndoOp::ReAddCategory { owner_id, category } => {
                self.store.add_category(&owner_id, category).map(|_| ())
            }
            UndoOp::RemoveRedemption { user_id, id } => {
                self.store.delete_redemption(&id, &user_id)
            }
            UndoOp::RestoreRedemption(tx) => self.store.update_redemption(tx).map(|_| ()),
            UndoOp::ReAddRedemption(tx) => self.store.add_redemption(tx).map(|_| ()),
        }
    }
}
