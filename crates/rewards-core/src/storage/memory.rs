//! In-memory ledger store.
//!
//! A plain document store behind a single mutex. It has no native
//! multi-document transaction primitive (`supports_transactions` is false),
//! which makes it the backend that exercises the batch executor's
//! compensating-rollback path. It doubles as the deterministic test double
//! for the `LedgerStore` contract.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::debug;

use super::traits::{LedgerStore, MAX_CUSTOM_CATEGORIES};
use super::types::{
    HistoryFilter, HistoryPage, LedgerRecord, PendingChange, RecordKey, RecordKind, RemoteChange,
};
use super::watch::{TotalPointsWatch, WatchRegistry};
use crate::clock::Clock;
use crate::error::{rules, LedgerError, Result};
use crate::model::{RedemptionTransaction, RewardCategory, RewardEntry};

#[derive(Default)]
struct State {
    /// (owner_id, category_id) -> category
    categories: BTreeMap<(String, String), RewardCategory>,
    /// entry id -> entry (ids are globally unique)
    entries: BTreeMap<String, RewardEntry>,
    /// redemption id -> transaction
    redemptions: BTreeMap<String, RedemptionTransaction>,
    /// keys with local changes the remote has not acknowledged
    dirty: BTreeSet<RecordKey>,
    /// last remote version observed per record
    remote_versions: HashMap<RecordKey, u64>,
    /// deleted-but-unacknowledged records, with the version the delete is
    /// conditioned on
    tombstones: BTreeMap<RecordKey, Option<u64>>,
    checkpoints: HashMap<String, DateTime<Utc>>,
}

/// In-memory implementation of [`LedgerStore`].
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    watchers: WatchRegistry,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            watchers: WatchRegistry::default(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Storage("memory store lock poisoned".to_string()))
    }

    fn total_in(state: &State, user_id: &str) -> i64 {
        state
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.points)
            .sum()
    }

    /// Notify watchers of `user_id` with the total computed under `state`,
    /// after releasing the lock.
    fn notify(&self, state: MutexGuard<'_, State>, user_id: &str) {
        let total = Self::total_in(&state, user_id);
        drop(state);
        self.watchers.notify(user_id, total);
    }
}

impl LedgerStore for MemoryStore {
    fn add_entry(&self, entry: RewardEntry) -> Result<RewardEntry> {
        let mut state = self.lock()?;
        if !state
            .categories
            .contains_key(&(entry.user_id.clone(), entry.category_id.clone()))
        {
            return Err(LedgerError::NotFound(format!(
                "category '{}' for user '{}'",
                entry.category_id, entry.user_id
            )));
        }
        if state.entries.contains_key(&entry.id) {
            return Err(LedgerError::Storage(format!(
                "entry id '{}' already exists",
                entry.id
            )));
        }
        let mut stored = entry;
        stored.is_synced = false;
        let key = RecordKey::new(&stored.user_id, RecordKind::Entry, &stored.id);
        state.entries.insert(stored.id.clone(), stored.clone());
        state.dirty.insert(key);
        let user_id = stored.user_id.clone();
        self.notify(state, &user_id);
        Ok(stored)
    }

    fn get_entry(&self, user_id: &str, entry_id: &str) -> Result<Option<RewardEntry>> {
        let state = self.lock()?;
        Ok(state
            .entries
            .get(entry_id)
            .filter(|e| e.user_id == user_id)
            .cloned())
    }

    fn update_entry(&self, entry: RewardEntry) -> Result<RewardEntry> {
        let mut state = self.lock()?;
        let stored = state
            .entries
            .get(&entry.id)
            .ok_or_else(|| LedgerError::NotFound(format!("entry '{}'", entry.id)))?;
        if stored.user_id != entry.user_id {
            return Err(LedgerError::Authorization(format!(
                "entry '{}' is not owned by user '{}'",
                entry.id, entry.user_id
            )));
        }
        if !stored.can_modify(self.clock.now()) {
            return Err(LedgerError::rule(
                rules::ENTRY_EDIT_WINDOW,
                format!("entry '{}' is outside its edit window", entry.id),
            ));
        }
        let mut next = entry;
        next.created_at = stored.created_at;
        next.is_synced = false;
        let key = RecordKey::new(&next.user_id, RecordKind::Entry, &next.id);
        state.entries.insert(next.id.clone(), next.clone());
        state.dirty.insert(key);
        let user_id = next.user_id.clone();
        self.notify(state, &user_id);
        Ok(next)
    }

    fn delete_entry(&self, entry_id: &str, requesting_user_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let stored = state
            .entries
            .get(entry_id)
            .ok_or_else(|| LedgerError::NotFound(format!("entry '{entry_id}'")))?;
        if stored.user_id != requesting_user_id {
            return Err(LedgerError::Authorization(format!(
                "entry '{entry_id}' is not owned by user '{requesting_user_id}'"
            )));
        }
        let key = RecordKey::new(&stored.user_id, RecordKind::Entry, entry_id);
        state.entries.remove(entry_id);
        state.dirty.remove(&key);
        if let Some(version) = state.remote_versions.remove(&key) {
            state.tombstones.insert(key, Some(version));
        }
        self.notify(state, requesting_user_id);
        Ok(())
    }

    fn history(&self, user_id: &str, filter: &HistoryFilter) -> Result<HistoryPage<RewardEntry>> {
        if filter.page == 0 || filter.limit == 0 {
            return Err(LedgerError::validation(
                "history page and limit must be at least 1",
            ));
        }
        let state = self.lock()?;
        let mut matches: Vec<&RewardEntry> = state
            .entries
            .values()
            .filter(|e| e.user_id == user_id)
            .filter(|e| {
                filter
                    .date_range
                    .as_ref()
                    .map_or(true, |range| range.contains(e.created_at))
            })
            .filter(|e| {
                filter
                    .category_id
                    .as_ref()
                    .map_or(true, |cat| &e.category_id == cat)
            })
            .filter(|e| filter.entry_type.map_or(true, |t| e.entry_type == t))
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = matches.len() as u64;
        let start = (filter.page as usize - 1) * filter.limit as usize;
        let items = matches
            .into_iter()
            .skip(start)
            .take(filter.limit as usize)
            .cloned()
            .collect();
        Ok(HistoryPage {
            items,
            page: filter.page,
            limit: filter.limit,
            total,
        })
    }

    fn total_points(&self, user_id: &str) -> Result<i64> {
        let state = self.lock()?;
        Ok(Self::total_in(&state, user_id))
    }

    fn watch_total_points(&self, user_id: &str) -> Result<TotalPointsWatch> {
        let state = self.lock()?;
        let total = Self::total_in(&state, user_id);
        drop(state);
        Ok(self.watchers.subscribe(user_id, total))
    }

    fn add_category(&self, owner_id: &str, category: RewardCategory) -> Result<RewardCategory> {
        let mut state = self.lock()?;
        let slot = (owner_id.to_string(), category.id.clone());
        if state.categories.contains_key(&slot) {
            return Err(LedgerError::Storage(format!(
                "category id '{}' already exists",
                category.id
            )));
        }
        if !category.is_default {
            let custom = state
                .categories
                .range((owner_id.to_string(), String::new())..)
                .take_while(|((owner, _), _)| owner == owner_id)
                .filter(|(_, c)| !c.is_default)
                .count();
            if custom >= MAX_CUSTOM_CATEGORIES {
                return Err(LedgerError::rule(
                    rules::CATEGORY_CAP,
                    format!("user '{owner_id}' already has {MAX_CUSTOM_CATEGORIES} custom categories"),
                ));
            }
        }
        let key = RecordKey::new(owner_id, RecordKind::Category, &category.id);
        state.categories.insert(slot, category.clone());
        state.dirty.insert(key);
        Ok(category)
    }

    fn update_category(&self, owner_id: &str, category: RewardCategory) -> Result<RewardCategory> {
        let mut state = self.lock()?;
        let slot = (owner_id.to_string(), category.id.clone());
        if !state.categories.contains_key(&slot) {
            return Err(LedgerError::NotFound(format!(
                "category '{}' for user '{owner_id}'",
                category.id
            )));
        }
        let key = RecordKey::new(owner_id, RecordKind::Category, &category.id);
        state.categories.insert(slot, category.clone());
        state.dirty.insert(key);
        Ok(category)
    }

    fn delete_category(&self, owner_id: &str, category_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let slot = (owner_id.to_string(), category_id.to_string());
        if state.categories.remove(&slot).is_none() {
            return Err(LedgerError::NotFound(format!(
                "category '{category_id}' for user '{owner_id}'"
            )));
        }
        let key = RecordKey::new(owner_id, RecordKind::Category, category_id);
        state.dirty.remove(&key);
        if let Some(version) = state.remote_versions.remove(&key) {
            state.tombstones.insert(key, Some(version));
        }
        Ok(())
    }

    fn get_category(&self, owner_id: &str, category_id: &str) -> Result<Option<RewardCategory>> {
        let state = self.lock()?;
        Ok(state
            .categories
            .get(&(owner_id.to_string(), category_id.to_string()))
            .cloned())
    }

    fn list_categories(&self, owner_id: &str) -> Result<Vec<RewardCategory>> {
        let state = self.lock()?;
        let mut list: Vec<RewardCategory> = state
            .categories
            .iter()
            .filter(|((owner, _), _)| owner == owner_id)
            .map(|(_, c)| c.clone())
            .collect();
        list.sort_by(|a, b| b.is_default.cmp(&a.is_default).then(a.name.cmp(&b.name)));
        Ok(list)
    }

    fn add_redemption(&self, tx: RedemptionTransaction) -> Result<RedemptionTransaction> {
        let mut state = self.lock()?;
        if state.redemptions.contains_key(&tx.id) {
            return Err(LedgerError::Storage(format!(
                "redemption id '{}' already exists",
                tx.id
            )));
        }
        let key = RecordKey::new(&tx.user_id, RecordKind::Redemption, &tx.id);
        state.redemptions.insert(tx.id.clone(), tx.clone());
        state.dirty.insert(key);
        Ok(tx)
    }

    fn update_redemption(&self, tx: RedemptionTransaction) -> Result<RedemptionTransaction> {
        let mut state = self.lock()?;
        let stored = state
            .redemptions
            .get(&tx.id)
            .ok_or_else(|| LedgerError::NotFound(format!("redemption '{}'", tx.id)))?;
        if stored.user_id != tx.user_id {
            return Err(LedgerError::Authorization(format!(
                "redemption '{}' is not owned by user '{}'",
                tx.id, tx.user_id
            )));
        }
        let key = RecordKey::new(&tx.user_id, RecordKind::Redemption, &tx.id);
        state.redemptions.insert(tx.id.clone(), tx.clone());
        state.dirty.insert(key);
        Ok(tx)
    }

    fn delete_redemption(&self, id: &str, requesting_user_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let stored = state
            .redemptions
            .get(id)
            .ok_or_else(|| LedgerError::NotFound(format!("redemption '{id}'")))?;
        if stored.user_id != requesting_user_id {
            return Err(LedgerError::Authorization(format!(
                "redemption '{id}' is not owned by user '{requesting_user_id}'"
            )));
        }
        let key = RecordKey::new(requesting_user_id, RecordKind::Redemption, id);
        state.redemptions.remove(id);
        state.dirty.remove(&key);
        if let Some(version) = state.remote_versions.remove(&key) {
            state.tombstones.insert(key, Some(version));
        }
        Ok(())
    }

    fn get_redemption(&self, user_id: &str, id: &str) -> Result<Option<RedemptionTransaction>> {
        let state = self.lock()?;
        Ok(state
            .redemptions
            .get(id)
            .filter(|tx| tx.user_id == user_id)
            .cloned())
    }

    fn list_redemptions(&self, user_id: &str) -> Result<Vec<RedemptionTransaction>> {
        let state = self.lock()?;
        let mut list: Vec<RedemptionTransaction> = state
            .redemptions
            .values()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(list)
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn pending_changes(&self, user_id: &str) -> Result<Vec<PendingChange>> {
        let state = self.lock()?;
        let mut changes = Vec::new();
        for key in state.dirty.iter().filter(|k| k.user_id == user_id) {
            let record = match key.kind {
                RecordKind::Entry => state.entries.get(&key.id).cloned().map(LedgerRecord::Entry),
                RecordKind::Category => state
                    .categories
                    .get(&(key.user_id.clone(), key.id.clone()))
                    .cloned()
                    .map(|category| LedgerRecord::Category {
                        owner_id: key.user_id.clone(),
                        category,
                    }),
                RecordKind::Redemption => state
                    .redemptions
                    .get(&key.id)
                    .cloned()
                    .map(LedgerRecord::Redemption),
            };
            // A dirty key without a record would be a bookkeeping bug; skip
            // rather than fabricate.
            if let Some(record) = record {
                changes.push(PendingChange {
                    key: key.clone(),
                    record: Some(record),
                    base_version: state.remote_versions.get(key).copied(),
                });
            }
        }
        for (key, base_version) in state.tombstones.iter().filter(|(k, _)| k.user_id == user_id) {
            changes.push(PendingChange {
                key: key.clone(),
                record: None,
                base_version: *base_version,
            });
        }
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(changes)
    }

    fn mark_synced(&self, key: &RecordKey, version: u64) -> Result<()> {
        let mut state = self.lock()?;
        state.dirty.remove(key);
        state.remote_versions.insert(key.clone(), version);
        if key.kind == RecordKind::Entry {
            if let Some(entry) = state.entries.get_mut(&key.id) {
                entry.is_synced = true;
            }
        }
        Ok(())
    }

    fn clear_tombstone(&self, key: &RecordKey) -> Result<()> {
        let mut state = self.lock()?;
        state.tombstones.remove(key);
        Ok(())
    }

    fn remote_version(&self, key: &RecordKey) -> Result<Option<u64>> {
        let state = self.lock()?;
        Ok(state
            .remote_versions
            .get(key)
            .copied()
            .or_else(|| state.tombstones.get(key).copied().flatten()))
    }

    fn rebase_pending(&self, key: &RecordKey, version: Option<u64>) -> Result<()> {
        let mut state = self.lock()?;
        if state.dirty.contains(key) {
            match version {
                Some(v) => {
                    state.remote_versions.insert(key.clone(), v);
                }
                None => {
                    state.remote_versions.remove(key);
                }
            }
            return Ok(());
        }
        if let Some(base) = state.tombstones.get_mut(key) {
            *base = version;
            return Ok(());
        }
        Err(LedgerError::NotFound(format!("pending change for {key}")))
    }

    fn apply_remote(&self, change: &RemoteChange) -> Result<bool> {
        let mut state = self.lock()?;
        let key = &change.key;
        debug!("apply_remote {} v{}", key, change.version);
        // A record edited locally after the caller's pending snapshot stays
        // pending; the next pass surfaces it as a conflict instead.
        if state.dirty.contains(key) {
            return Ok(false);
        }
        match &change.record {
            Some(LedgerRecord::Entry(entry)) => {
                let mut entry = entry.clone();
                entry.is_synced = true;
                state.entries.insert(entry.id.clone(), entry);
            }
            Some(LedgerRecord::Category { owner_id, category }) => {
                state
                    .categories
                    .insert((owner_id.clone(), category.id.clone()), category.clone());
            }
            Some(LedgerRecord::Redemption(tx)) => {
                state.redemptions.insert(tx.id.clone(), tx.clone());
            }
            None => {
                let removed = match key.kind {
                    RecordKind::Entry => state.entries.remove(&key.id).is_some(),
                    RecordKind::Category => state
                        .categories
                        .remove(&(key.user_id.clone(), key.id.clone()))
                        .is_some(),
                    RecordKind::Redemption => state.redemptions.remove(&key.id).is_some(),
                };
                state.remote_versions.remove(key);
                state.tombstones.remove(key);
                state.dirty.remove(key);
                if removed && key.kind == RecordKind::Entry {
                    let user_id = key.user_id.clone();
                    self.notify(state, &user_id);
                }
                return Ok(removed);
            }
        }
        state.dirty.remove(key);
        state.remote_versions.insert(key.clone(), change.version);
        if key.kind == RecordKind::Entry {
            let user_id = key.user_id.clone();
            self.notify(state, &user_id);
        }
        Ok(true)
    }

    fn sync_checkpoint(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.lock()?;
        Ok(state.checkpoints.get(user_id).copied())
    }

    fn set_sync_checkpoint(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        state.checkpoints.insert(user_id.to_string(), at);
        Ok(())
    }
}
