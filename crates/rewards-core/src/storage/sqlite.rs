//! SQLite-backed ledger store.
//!
//! The backend with a native multi-document transaction primitive:
//! `apply_batch` runs inside one SQLite transaction. Sync bookkeeping lives
//! in `is_synced`/`dirty`/`remote_version` columns plus `tombstones` and
//! `sync_checkpoints` tables.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::{LedgerStore, MAX_CUSTOM_CATEGORIES};
use super::types::{
    BatchOperation, HistoryFilter, HistoryPage, LedgerRecord, PendingChange, RecordKey,
    RecordKind, RemoteChange,
};
use super::watch::{TotalPointsWatch, WatchRegistry};
use crate::clock::Clock;
use crate::error::{rules, LedgerError, Result};
use crate::model::{EntryType, RedemptionStatus, RedemptionTransaction, RewardCategory, RewardEntry};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS categories (
    owner_id       TEXT NOT NULL,
    id             TEXT NOT NULL,
    name           TEXT NOT NULL,
    description    TEXT,
    color          TEXT NOT NULL,
    icon           TEXT NOT NULL,
    is_default     INTEGER NOT NULL,
    dirty          INTEGER NOT NULL DEFAULT 1,
    remote_version INTEGER,
    PRIMARY KEY (owner_id, id)
);

CREATE TABLE IF NOT EXISTS entries (
    id             TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL,
    points         INTEGER NOT NULL,
    description    TEXT NOT NULL,
    category_id    TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    entry_type     TEXT NOT NULL,
    is_synced      INTEGER NOT NULL DEFAULT 0,
    remote_version INTEGER
);
CREATE INDEX IF NOT EXISTS idx_entries_user_created
    ON entries (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS redemptions (
    id             TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL,
    option_id      TEXT NOT NULL,
    points_used    INTEGER NOT NULL,
    redeemed_at    TEXT NOT NULL,
    status         TEXT NOT NULL,
    notes          TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT,
    completed_at   TEXT,
    cancelled_at   TEXT,
    dirty          INTEGER NOT NULL DEFAULT 1,
    remote_version INTEGER
);
CREATE INDEX IF NOT EXISTS idx_redemptions_user
    ON redemptions (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS tombstones (
    user_id      TEXT NOT NULL,
    kind         TEXT NOT NULL,
    record_id    TEXT NOT NULL,
    base_version INTEGER,
    PRIMARY KEY (user_id, kind, record_id)
);

CREATE TABLE IF NOT EXISTS sync_checkpoints (
    user_id    TEXT PRIMARY KEY,
    checkpoint TEXT NOT NULL
);
";

/// SQLite implementation of [`LedgerStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    watchers: WatchRegistry,
}

fn ts(at: DateTime<Utc>) -> String {
    // Fixed-width UTC so string comparison orders like the instant.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Storage(format!("bad timestamp '{value}': {e}")))
}

fn parse_ts_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(&v)).transpose()
}

impl SqliteStore {
    /// Open (creating if needed) a ledger database at `path`.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, clock)
    }

    /// Open a private in-memory database; used by tests and demos.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            watchers: WatchRegistry::default(),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Storage("SQLite connection poisoned".to_string()))
    }

    fn total_in(conn: &Connection, user_id: &str) -> Result<i64> {
        let total = conn.query_row(
            "SELECT COALESCE(SUM(points), 0) FROM entries WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Recompute and broadcast the totals of `user_ids` after a commit.
    fn notify_users(&self, conn: &Connection, user_ids: &[String]) -> Result<()> {
        let mut seen = Vec::new();
        for user_id in user_ids {
            if seen.contains(user_id) {
                continue;
            }
            let total = Self::total_in(conn, user_id)?;
            seen.push(user_id.clone());
            self.watchers.notify(user_id, total);
        }
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RewardEntry, Option<u64>)> {
        let created_at: String = row.get(5)?;
        let entry_type: String = row.get(6)?;
        let entry = RewardEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            points: row.get(2)?,
            description: row.get(3)?,
            category_id: row.get(4)?,
            created_at: parse_ts(&created_at)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            entry_type: EntryType::parse(&entry_type)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            is_synced: row.get::<_, i64>(7)? != 0,
        };
        let version: Option<i64> = row.get(8)?;
        Ok((entry, version.map(|v| v as u64)))
    }

    fn row_to_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<RewardCategory> {
        Ok(RewardCategory {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            color: row.get(3)?,
            icon: row.get(4)?,
            is_default: row.get::<_, i64>(5)? != 0,
        })
    }

    fn row_to_redemption(row: &rusqlite::Row<'_>) -> rusqlite::Result<RedemptionTransaction> {
        let redeemed_at: String = row.get(4)?;
        let status: String = row.get(5)?;
        let created_at: String = row.get(7)?;
        let to_ts = |v: Option<String>| {
            parse_ts_opt(v).map_err(|_| rusqlite::Error::InvalidQuery)
        };
        Ok(RedemptionTransaction {
            id: row.get(0)?,
            user_id: row.get(1)?,
            option_id: row.get(2)?,
            points_used: row.get(3)?,
            redeemed_at: parse_ts(&redeemed_at).map_err(|_| rusqlite::Error::InvalidQuery)?,
            status: RedemptionStatus::parse(&status).map_err(|_| rusqlite::Error::InvalidQuery)?,
            notes: row.get(6)?,
            created_at: parse_ts(&created_at).map_err(|_| rusqlite::Error::InvalidQuery)?,
            updated_at: to_ts(row.get(8)?)?,
            completed_at: to_ts(row.get(9)?)?,
            cancelled_at: to_ts(row.get(10)?)?,
        })
    }

    const ENTRY_COLS: &'static str =
        "id, user_id, points, description, category_id, created_at, entry_type, is_synced, remote_version";
    const CATEGORY_COLS: &'static str = "id, name, description, color, icon, is_default";
    const REDEMPTION_COLS: &'static str = "id, user_id, option_id, points_used, redeemed_at, \
         status, notes, created_at, updated_at, completed_at, cancelled_at";

    // --- per-operation helpers, shared by the trait impl and apply_batch ---

    fn insert_entry(conn: &Connection, entry: &RewardEntry) -> Result<RewardEntry> {
        let category_exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM categories WHERE owner_id = ?1 AND id = ?2",
                params![entry.user_id, entry.category_id],
                |row| row.get(0),
            )
            .optional()?;
        if category_exists.is_none() {
            return Err(LedgerError::NotFound(format!(
                "category '{}' for user '{}'",
                entry.category_id, entry.user_id
            )));
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM entries WHERE id = ?1",
                params![entry.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LedgerError::Storage(format!(
                "entry id '{}' already exists",
                entry.id
            )));
        }
        let mut stored = entry.clone();
        stored.is_synced = false;
        conn.execute(
            "INSERT INTO entries (id, user_id, points, description, category_id, created_at, \
             entry_type, is_synced, remote_version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL)",
            params![
                stored.id,
                stored.user_id,
                stored.points,
                stored.description,
                stored.category_id,
                ts(stored.created_at),
                stored.entry_type.as_str(),
            ],
        )?;
        Ok(stored)
    }

    fn replace_entry(conn: &Connection, clock: &dyn Clock, entry: &RewardEntry) -> Result<RewardEntry> {
        let stored = Self::select_entry(conn, &entry.id)?
            .ok_or_else(|| LedgerError::NotFound(format!("entry '{}'", entry.id)))?;
        if stored.user_id != entry.user_id {
            return Err(LedgerError::Authorization(format!(
                "entry '{}' is not owned by user '{}'",
                entry.id, entry.user_id
            )));
        }
        if !stored.can_modify(clock.now()) {
            return Err(LedgerError::rule(
                rules::ENTRY_EDIT_WINDOW,
                format!("entry '{}' is outside its edit window", entry.id),
            ));
        }
        let mut next = entry.clone();
        next.created_at = stored.created_at;
        next.is_synced = false;
        conn.execute(
            "UPDATE entries SET points = ?2, description = ?3, category_id = ?4, \
             entry_type = ?5, is_synced = 0 WHERE id = ?1",
            params![
                next.id,
                next.points,
                next.description,
                next.category_id,
                next.entry_type.as_str(),
            ],
        )?;
        Ok(next)
    }

    fn remove_entry(conn: &Connection, entry_id: &str, requesting_user_id: &str) -> Result<()> {
        let stored = Self::select_entry(conn, entry_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("entry '{entry_id}'")))?;
        if stored.user_id != requesting_user_id {
            return Err(LedgerError::Authorization(format!(
                "entry '{entry_id}' is not owned by user '{requesting_user_id}'"
            )));
        }
        let version: Option<i64> = conn.query_row(
            "SELECT remote_version FROM entries WHERE id = ?1",
            params![entry_id],
            |row| row.get(0),
        )?;
        conn.execute("DELETE FROM entries WHERE id = ?1", params![entry_id])?;
        if let Some(version) = version {
            conn.execute(
                "INSERT OR REPLACE INTO tombstones (user_id, kind, record_id, base_version) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    requesting_user_id,
                    RecordKind::Entry.as_str(),
                    entry_id,
                    version
                ],
            )?;
        }
        Ok(())
    }

    fn select_entry(conn: &Connection, entry_id: &str) -> Result<Option<RewardEntry>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", Self::ENTRY_COLS),
                params![entry_id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(row.map(|(entry, _)| entry))
    }

    fn insert_category(
        conn: &Connection,
        owner_id: &str,
        category: &RewardCategory,
    ) -> Result<RewardCategory> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM categories WHERE owner_id = ?1 AND id = ?2",
                params![owner_id, category.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LedgerError::Storage(format!(
                "category id '{}' already exists",
                category.id
            )));
        }
        if !category.is_default {
            let custom: i64 = conn.query_row(
                "SELECT COUNT(*) FROM categories WHERE owner_id = ?1 AND is_default = 0",
                params![owner_id],
                |row| row.get(0),
            )?;
            if custom as usize >= MAX_CUSTOM_CATEGORIES {
                return Err(LedgerError::rule(
                    rules::CATEGORY_CAP,
                    format!(
                        "user '{owner_id}' already has {MAX_CUSTOM_CATEGORIES} custom categories"
                    ),
                ));
            }
        }
        conn.execute(
            "INSERT INTO categories (owner_id, id, name, description, color, icon, is_default, \
             dirty, remote_version) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, NULL)",
            params![
                owner_id,
                category.id,
                category.name,
                category.description,
                category.color,
                category.icon,
                category.is_default as i64,
            ],
        )?;
        Ok(category.clone())
    }

    fn replace_category(
        conn: &Connection,
        owner_id: &str,
        category: &RewardCategory,
    ) -> Result<RewardCategory> {
        let changed = conn.execute(
            "UPDATE categories SET name = ?3, description = ?4, color = ?5, icon = ?6, \
             is_default = ?7, dirty = 1 WHERE owner_id = ?1 AND id = ?2",
            params![
                owner_id,
                category.id,
                category.name,
                category.description,
                category.color,
                category.icon,
                category.is_default as i64,
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(format!(
                "category '{}' for user '{owner_id}'",
                category.id
            )));
        }
        Ok(category.clone())
    }

    fn remove_category(conn: &Connection, owner_id: &str, category_id: &str) -> Result<()> {
        let version: Option<Option<i64>> = conn
            .query_row(
                "SELECT remote_version FROM categories WHERE owner_id = ?1 AND id = ?2",
                params![owner_id, category_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(version) = version else {
            return Err(LedgerError::NotFound(format!(
                "category '{category_id}' for user '{owner_id}'"
            )));
        };
        conn.execute(
            "DELETE FROM categories WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, category_id],
        )?;
        if let Some(version) = version {
            conn.execute(
                "INSERT OR REPLACE INTO tombstones (user_id, kind, record_id, base_version) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner_id, RecordKind::Category.as_str(), category_id, version],
            )?;
        }
        Ok(())
    }

    fn insert_redemption(
        conn: &Connection,
        tx: &RedemptionTransaction,
    ) -> Result<RedemptionTransaction> {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM redemptions WHERE id = ?1",
                params![tx.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LedgerError::Storage(format!(
                "redemption id '{}' already exists",
                tx.id
            )));
        }
        conn.execute(
            "INSERT INTO redemptions (id, user_id, option_id, points_used, redeemed_at, status, \
             notes, created_at, updated_at, completed_at, cancelled_at, dirty, remote_version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, NULL)",
            params![
                tx.id,
                tx.user_id,
                tx.option_id,
                tx.points_used,
                ts(tx.redeemed_at),
                tx.status.as_str(),
                tx.notes,
                ts(tx.created_at),
                tx.updated_at.map(ts),
                tx.completed_at.map(ts),
                tx.cancelled_at.map(ts),
            ],
        )?;
        Ok(tx.clone())
    }

    fn replace_redemption(
        conn: &Connection,
        tx: &RedemptionTransaction,
    ) -> Result<RedemptionTransaction> {
        let owner: Option<String> = conn
            .query_row(
                "SELECT user_id FROM redemptions WHERE id = ?1",
                params![tx.id],
                |row| row.get(0),
            )
            .optional()?;
        let owner =
            owner.ok_or_else(|| LedgerError::NotFound(format!("redemption '{}'", tx.id)))?;
        if owner != tx.user_id {
            return Err(LedgerError::Authorization(format!(
                "redemption '{}' is not owned by user '{}'",
                tx.id, tx.user_id
            )));
        }
        conn.execute(
            "UPDATE redemptions SET option_id = ?2, points_used = ?3, redeemed_at = ?4, \
             status = ?5, notes = ?6, updated_at = ?7, completed_at = ?8, cancelled_at = ?9, \
             dirty = 1 WHERE id = ?1",
            params![
                tx.id,
                tx.option_id,
                tx.points_used,
                ts(tx.redeemed_at),
                tx.status.as_str(),
                tx.notes,
                tx.updated_at.map(ts),
                tx.completed_at.map(ts),
                tx.cancelled_at.map(ts),
            ],
        )?;
        Ok(tx.clone())
    }

    fn remove_redemption(conn: &Connection, id: &str, requesting_user_id: &str) -> Result<()> {
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT user_id, remote_version FROM redemptions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((owner, version)) = row else {
            return Err(LedgerError::NotFound(format!("redemption '{id}'")));
        };
        if owner != requesting_user_id {
            return Err(LedgerError::Authorization(format!(
                "redemption '{id}' is not owned by user '{requesting_user_id}'"
            )));
        }
        conn.execute("DELETE FROM redemptions WHERE id = ?1", params![id])?;
        if let Some(version) = version {
            conn.execute(
                "INSERT OR REPLACE INTO tombstones (user_id, kind, record_id, base_version) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![requesting_user_id, RecordKind::Redemption.as_str(), id, version],
            )?;
        }
        Ok(())
    }

    /// Whether the local copy of `key` carries an unacknowledged change.
    fn is_locally_dirty(conn: &Connection, key: &RecordKey) -> Result<bool> {
        let flag: Option<i64> = match key.kind {
            RecordKind::Entry => conn
                .query_row(
                    "SELECT is_synced FROM entries WHERE id = ?1",
                    params![key.id],
                    |row| row.get(0),
                )
                .optional()?,
            RecordKind::Category => conn
                .query_row(
                    "SELECT dirty FROM categories WHERE owner_id = ?1 AND id = ?2",
                    params![key.user_id, key.id],
                    |row| row.get(0),
                )
                .optional()?,
            RecordKind::Redemption => conn
                .query_row(
                    "SELECT dirty FROM redemptions WHERE id = ?1",
                    params![key.id],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(match (key.kind, flag) {
            (RecordKind::Entry, Some(is_synced)) => is_synced == 0,
            (_, Some(dirty)) => dirty != 0,
            (_, None) => false,
        })
    }

    fn apply_op(
        conn: &Connection,
        clock: &dyn Clock,
        op: &BatchOperation,
        touched_users: &mut Vec<String>,
    ) -> Result<Option<LedgerRecord>> {
        match op {
            BatchOperation::AddEntry(entry) => {
                let stored = Self::insert_entry(conn, entry)?;
                touched_users.push(stored.user_id.clone());
                Ok(Some(LedgerRecord::Entry(stored)))
            }
            BatchOperation::UpdateEntry(entry) => {
                let stored = Self::replace_entry(conn, clock, entry)?;
                touched_users.push(stored.user_id.clone());
                Ok(Some(LedgerRecord::Entry(stored)))
            }
            BatchOperation::DeleteEntry {
                entry_id,
                requesting_user_id,
            } => {
                Self::remove_entry(conn, entry_id, requesting_user_id)?;
                touched_users.push(requesting_user_id.clone());
                Ok(None)
            }
            BatchOperation::AddCategory { owner_id, category } => {
                let stored = Self::insert_category(conn, owner_id, category)?;
                Ok(Some(LedgerRecord::Category {
                    owner_id: owner_id.clone(),
                    category: stored,
                }))
            }
            BatchOperation::UpdateCategory { owner_id, category } => {
                let stored = Self::replace_category(conn, owner_id, category)?;
                Ok(Some(LedgerRecord::Category {
                    owner_id: owner_id.clone(),
                    category: stored,
                }))
            }
            BatchOperation::DeleteCategory {
                owner_id,
                category_id,
            } => {
                Self::remove_category(conn, owner_id, category_id)?;
                Ok(None)
            }
            BatchOperation::AddRedemption(tx) => Ok(Some(LedgerRecord::Redemption(
                Self::insert_redemption(conn, tx)?,
            ))),
            BatchOperation::UpdateRedemption(tx) => Ok(Some(LedgerRecord::Redemption(
                Self::replace_redemption(conn, tx)?,
            ))),
            BatchOperation::DeleteRedemption {
                id,
                requesting_user_id,
            } => {
                Self::remove_redemption(conn, id, requesting_user_id)?;
                Ok(None)
            }
        }
    }
}

impl LedgerStore for SqliteStore {
    fn add_entry(&self, entry: RewardEntry) -> Result<RewardEntry> {
        let conn = self.lock_conn()?;
        let stored = Self::insert_entry(&conn, &entry)?;
        self.notify_users(&conn, &[stored.user_id.clone()])?;
        Ok(stored)
    }

    fn get_entry(&self, user_id: &str, entry_id: &str) -> Result<Option<RewardEntry>> {
        let conn = self.lock_conn()?;
        Ok(Self::select_entry(&conn, entry_id)?.filter(|e| e.user_id == user_id))
    }

    fn update_entry(&self, entry: RewardEntry) -> Result<RewardEntry> {
        let conn = self.lock_conn()?;
        let stored = Self::replace_entry(&conn, self.clock.as_ref(), &entry)?;
        self.notify_users(&conn, &[stored.user_id.clone()])?;
        Ok(stored)
    }

    fn delete_entry(&self, entry_id: &str, requesting_user_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::remove_entry(&conn, entry_id, requesting_user_id)?;
        self.notify_users(&conn, &[requesting_user_id.to_string()])?;
        Ok(())
    }

    fn history(&self, user_id: &str, filter: &HistoryFilter) -> Result<HistoryPage<RewardEntry>> {
        if filter.page == 0 || filter.limit == 0 {
            return Err(LedgerError::validation(
                "history page and limit must be at least 1",
            ));
        }
        let conn = self.lock_conn()?;
        let mut where_sql = String::from("WHERE user_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];
        if let Some(range) = &filter.date_range {
            if let Some(from) = range.from {
                args.push(Box::new(ts(from)));
                where_sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
            }
            if let Some(to) = range.to {
                args.push(Box::new(ts(to)));
                where_sql.push_str(&format!(" AND created_at <= ?{}", args.len()));
            }
        }
        if let Some(category_id) = &filter.category_id {
            args.push(Box::new(category_id.clone()));
            where_sql.push_str(&format!(" AND category_id = ?{}", args.len()));
        }
        if let Some(entry_type) = filter.entry_type {
            args.push(Box::new(entry_type.as_str().to_string()));
            where_sql.push_str(&format!(" AND entry_type = ?{}", args.len()));
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM entries {where_sql}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        let offset = (filter.page as i64 - 1) * filter.limit as i64;
        args.push(Box::new(filter.limit as i64));
        let limit_idx = args.len();
        args.push(Box::new(offset));
        let offset_idx = args.len();
        let sql = format!(
            "SELECT {} FROM entries {where_sql} ORDER BY created_at DESC, id DESC \
             LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
            Self::ENTRY_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::row_to_entry,
        )?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?.0);
        }
        Ok(HistoryPage {
            items,
            page: filter.page,
            limit: filter.limit,
            total: total as u64,
        })
    }

    fn total_points(&self, user_id: &str) -> Result<i64> {
        let conn = self.lock_conn()?;
        Self::total_in(&conn, user_id)
    }

    fn watch_total_points(&self, user_id: &str) -> Result<TotalPointsWatch> {
        let conn = self.lock_conn()?;
        let total = Self::total_in(&conn, user_id)?;
        drop(conn);
        Ok(self.watchers.subscribe(user_id, total))
    }

    fn add_category(&self, owner_id: &str, category: RewardCategory) -> Result<RewardCategory> {
        let conn = self.lock_conn()?;
        Self::insert_category(&conn, owner_id, &category)
    }

    fn update_category(&self, owner_id: &str, category: RewardCategory) -> Result<RewardCategory> {
        let conn = self.lock_conn()?;
        Self::replace_category(&conn, owner_id, &category)
    }

    fn delete_category(&self, owner_id: &str, category_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::remove_category(&conn, owner_id, category_id)
    }

    fn get_category(&self, owner_id: &str, category_id: &str) -> Result<Option<RewardCategory>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM categories WHERE owner_id = ?1 AND id = ?2",
                    Self::CATEGORY_COLS
                ),
                params![owner_id, category_id],
                Self::row_to_category,
            )
            .optional()?;
        Ok(row)
    }

    fn list_categories(&self, owner_id: &str) -> Result<Vec<RewardCategory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM categories WHERE owner_id = ?1 \
             ORDER BY is_default DESC, name ASC",
            Self::CATEGORY_COLS
        ))?;
        let rows = stmt.query_map(params![owner_id], Self::row_to_category)?;
        let mut list = Vec::new();
        for row in rows {
            list.push(row?);
        }
        Ok(list)
    }

    fn add_redemption(&self, tx: RedemptionTransaction) -> Result<RedemptionTransaction> {
        let conn = self.lock_conn()?;
        Self::insert_redemption(&conn, &tx)
    }

    fn update_redemption(&self, tx: RedemptionTransaction) -> Result<RedemptionTransaction> {
        let conn = self.lock_conn()?;
        Self::replace_redemption(&conn, &tx)
    }

    fn delete_redemption(&self, id: &str, requesting_user_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::remove_redemption(&conn, id, requesting_user_id)
    }

    fn get_redemption(&self, user_id: &str, id: &str) -> Result<Option<RedemptionTransaction>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM redemptions WHERE id = ?1", Self::REDEMPTION_COLS),
                params![id],
                Self::row_to_redemption,
            )
            .optional()?;
        Ok(row.filter(|tx| tx.user_id == user_id))
    }

    fn list_redemptions(&self, user_id: &str) -> Result<Vec<RedemptionTransaction>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM redemptions WHERE user_id = ?1 \
             ORDER BY created_at DESC, id DESC",
            Self::REDEMPTION_COLS
        ))?;
        let rows = stmt.query_map(params![user_id], Self::row_to_redemption)?;
        let mut list = Vec::new();
        for row in rows {
            list.push(row?);
        }
        Ok(list)
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn apply_batch(&self, ops: &[BatchOperation]) -> Result<Vec<LedgerRecord>> {
        let mut conn = self.lock_conn()?;
        let mut touched_users = Vec::new();
        let mut results = Vec::new();
        let tx = conn.transaction()?;
        for op in ops {
            if let Some(record) = Self::apply_op(&tx, self.clock.as_ref(), op, &mut touched_users)? {
                results.push(record);
            }
        }
        tx.commit()?;
        debug!("applied batch of {} ops in one transaction", ops.len());
        self.notify_users(&conn, &touched_users)?;
        Ok(results)
    }

    fn pending_changes(&self, user_id: &str) -> Result<Vec<PendingChange>> {
        let conn = self.lock_conn()?;
        let mut changes = Vec::new();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entries WHERE user_id = ?1 AND is_synced = 0",
            Self::ENTRY_COLS
        ))?;
        for row in stmt.query_map(params![user_id], Self::row_to_entry)? {
            let (entry, version) = row?;
            changes.push(PendingChange {
                key: RecordKey::new(user_id, RecordKind::Entry, &entry.id),
                record: Some(LedgerRecord::Entry(entry)),
                base_version: version,
            });
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {}, remote_version FROM categories WHERE owner_id = ?1 AND dirty = 1",
            Self::CATEGORY_COLS
        ))?;
        for row in stmt.query_map(params![user_id], |row| {
            let category = Self::row_to_category(row)?;
            let version: Option<i64> = row.get(6)?;
            Ok((category, version))
        })? {
            let (category, version) = row?;
            changes.push(PendingChange {
                key: RecordKey::new(user_id, RecordKind::Category, &category.id),
                record: Some(LedgerRecord::Category {
                    owner_id: user_id.to_string(),
                    category,
                }),
                base_version: version.map(|v| v as u64),
            });
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {}, remote_version FROM redemptions WHERE user_id = ?1 AND dirty = 1",
            Self::REDEMPTION_COLS
        ))?;
        for row in stmt.query_map(params![user_id], |row| {
            let tx = Self::row_to_redemption(row)?;
            let version: Option<i64> = row.get(11)?;
            Ok((tx, version))
        })? {
            let (tx, version) = row?;
            changes.push(PendingChange {
                key: RecordKey::new(user_id, RecordKind::Redemption, &tx.id),
                record: Some(LedgerRecord::Redemption(tx)),
                base_version: version.map(|v| v as u64),
            });
        }

        let mut stmt = conn.prepare(
            "SELECT kind, record_id, base_version FROM tombstones WHERE user_id = ?1",
        )?;
        for row in stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })? {
            let (kind, record_id, version) = row?;
            changes.push(PendingChange {
                key: RecordKey::new(user_id, RecordKind::parse(&kind)?, record_id),
                record: None,
                base_version: version.map(|v| v as u64),
            });
        }

        changes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(changes)
    }

    fn mark_synced(&self, key: &RecordKey, version: u64) -> Result<()> {
        let conn = self.lock_conn()?;
        match key.kind {
            RecordKind::Entry => {
                conn.execute(
                    "UPDATE entries SET is_synced = 1, remote_version = ?2 WHERE id = ?1",
                    params![key.id, version as i64],
                )?;
            }
            RecordKind::Category => {
                conn.execute(
                    "UPDATE categories SET dirty = 0, remote_version = ?3 \
                     WHERE owner_id = ?1 AND id = ?2",
                    params![key.user_id, key.id, version as i64],
                )?;
            }
            RecordKind::Redemption => {
                conn.execute(
                    "UPDATE redemptions SET dirty = 0, remote_version = ?2 WHERE id = ?1",
                    params![key.id, version as i64],
                )?;
            }
        }
        Ok(())
    }

    fn clear_tombstone(&self, key: &RecordKey) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM tombstones WHERE user_id = ?1 AND kind = ?2 AND record_id = ?3",
            params![key.user_id, key.kind.as_str(), key.id],
        )?;
        Ok(())
    }

    fn remote_version(&self, key: &RecordKey) -> Result<Option<u64>> {
        let conn = self.lock_conn()?;
        let sql = match key.kind {
            RecordKind::Entry => "SELECT remote_version FROM entries WHERE id = ?2",
            RecordKind::Category => {
                "SELECT remote_version FROM categories WHERE owner_id = ?1 AND id = ?2"
            }
            RecordKind::Redemption => "SELECT remote_version FROM redemptions WHERE id = ?2",
        };
        let version: Option<Option<i64>> = conn
            .query_row(sql, params![key.user_id, key.id], |row| row.get(0))
            .optional()?;
        if let Some(version) = version {
            return Ok(version.map(|v| v as u64));
        }
        let tombstone: Option<Option<i64>> = conn
            .query_row(
                "SELECT base_version FROM tombstones \
                 WHERE user_id = ?1 AND kind = ?2 AND record_id = ?3",
                params![key.user_id, key.kind.as_str(), key.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tombstone.flatten().map(|v| v as u64))
    }

    fn rebase_pending(&self, key: &RecordKey, version: Option<u64>) -> Result<()> {
        let conn = self.lock_conn()?;
        let version_sql = version.map(|v| v as i64);
        let changed = match key.kind {
            RecordKind::Entry => conn.execute(
                "UPDATE entries SET remote_version = ?2 WHERE id = ?1 AND is_synced = 0",
                params![key.id, version_sql],
            )?,
            RecordKind::Category => conn.execute(
                "UPDATE categories SET remote_version = ?3 \
                 WHERE owner_id = ?1 AND id = ?2 AND dirty = 1",
                params![key.user_id, key.id, version_sql],
            )?,
            RecordKind::Redemption => conn.execute(
                "UPDATE redemptions SET remote_version = ?2 WHERE id = ?1 AND dirty = 1",
                params![key.id, version_sql],
            )?,
        };
        if changed > 0 {
            return Ok(());
        }
        let changed = conn.execute(
            "UPDATE tombstones SET base_version = ?4 \
             WHERE user_id = ?1 AND kind = ?2 AND record_id = ?3",
            params![key.user_id, key.kind.as_str(), key.id, version_sql],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(format!("pending change for {key}")));
        }
        Ok(())
    }

    fn apply_remote(&self, change: &RemoteChange) -> Result<bool> {
        let conn = self.lock_conn()?;
        let key = &change.key;
        debug!("apply_remote {} v{}", key, change.version);
        // A record edited locally after the caller's pending snapshot stays
        // pending; the next pass surfaces it as a conflict instead.
        if Self::is_locally_dirty(&conn, key)? {
            return Ok(false);
        }
        match &change.record {
            Some(LedgerRecord::Entry(entry)) => {
                conn.execute(
                    "INSERT OR REPLACE INTO entries (id, user_id, points, description, \
                     category_id, created_at, entry_type, is_synced, remote_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
                    params![
                        entry.id,
                        entry.user_id,
                        entry.points,
                        entry.description,
                        entry.category_id,
                        ts(entry.created_at),
                        entry.entry_type.as_str(),
                        change.version as i64,
                    ],
                )?;
                self.notify_users(&conn, &[entry.user_id.clone()])?;
            }
            Some(LedgerRecord::Category { owner_id, category }) => {
                conn.execute(
                    "INSERT OR REPLACE INTO categories (owner_id, id, name, description, color, \
                     icon, is_default, dirty, remote_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                    params![
                        owner_id,
                        category.id,
                        category.name,
                        category.description,
                        category.color,
                        category.icon,
                        category.is_default as i64,
                        change.version as i64,
                    ],
                )?;
            }
            Some(LedgerRecord::Redemption(tx)) => {
                conn.execute(
                    "INSERT OR REPLACE INTO redemptions (id, user_id, option_id, points_used, \
                     redeemed_at, status, notes, created_at, updated_at, completed_at, \
                     cancelled_at, dirty, remote_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
                    params![
                        tx.id,
                        tx.user_id,
                        tx.option_id,
                        tx.points_used,
                        ts(tx.redeemed_at),
                        tx.status.as_str(),
                        tx.notes,
                        ts(tx.created_at),
                        tx.updated_at.map(ts),
                        tx.completed_at.map(ts),
                        tx.cancelled_at.map(ts),
                        change.version as i64,
                    ],
                )?;
            }
            None => {
                let removed = match key.kind {
                    RecordKind::Entry => {
                        let removed =
                            conn.execute("DELETE FROM entries WHERE id = ?1", params![key.id])?;
                        if removed > 0 {
                            self.notify_users(&conn, &[key.user_id.clone()])?;
                        }
                        removed
                    }
                    RecordKind::Category => conn.execute(
                        "DELETE FROM categories WHERE owner_id = ?1 AND id = ?2",
                        params![key.user_id, key.id],
                    )?,
                    RecordKind::Redemption => {
                        conn.execute("DELETE FROM redemptions WHERE id = ?1", params![key.id])?
                    }
                };
                conn.execute(
                    "DELETE FROM tombstones WHERE user_id = ?1 AND kind = ?2 AND record_id = ?3",
                    params![key.user_id, key.kind.as_str(), key.id],
                )?;
                return Ok(removed > 0);
            }
        }
        Ok(true)
    }

    fn sync_checkpoint(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let checkpoint: Option<String> = conn
            .query_row(
                "SELECT checkpoint FROM sync_checkpoints WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        parse_ts_opt(checkpoint)
    }

    fn set_sync_checkpoint(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_checkpoints (user_id, checkpoint) VALUES (?1, ?2)",
            params![user_id, ts(at)],
        )?;
        Ok(())
    }
}
