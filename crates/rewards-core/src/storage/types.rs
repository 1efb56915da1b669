//! Core data types for the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::model::{EntryType, RedemptionTransaction, RewardCategory, RewardEntry};

/// Which table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entry,
    Category,
    Redemption,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entry => "entry",
            RecordKind::Category => "category",
            RecordKind::Redemption => "redemption",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "entry" => Ok(RecordKind::Entry),
            "category" => Ok(RecordKind::Category),
            "redemption" => Ok(RecordKind::Redemption),
            other => Err(LedgerError::Storage(format!(
                "unknown record kind '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one record across local and remote stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub user_id: String,
    pub kind: RecordKind,
    pub id: String,
}

impl RecordKey {
    pub fn new(user_id: impl Into<String>, kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.kind, self.id)
    }
}

/// A record as it crosses the store boundary.
///
/// Categories carry their owner here because the entity itself does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    Entry(RewardEntry),
    Category {
        owner_id: String,
        category: RewardCategory,
    },
    Redemption(RedemptionTransaction),
}

impl LedgerRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            LedgerRecord::Entry(entry) => {
                RecordKey::new(&entry.user_id, RecordKind::Entry, &entry.id)
            }
            LedgerRecord::Category { owner_id, category } => {
                RecordKey::new(owner_id, RecordKind::Category, &category.id)
            }
            LedgerRecord::Redemption(tx) => {
                RecordKey::new(&tx.user_id, RecordKind::Redemption, &tx.id)
            }
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            LedgerRecord::Entry(entry) => &entry.user_id,
            LedgerRecord::Category { owner_id, .. } => owner_id,
            LedgerRecord::Redemption(tx) => &tx.user_id,
        }
    }
}

/// Inclusive time window for history queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if let Some(from) = self.from {
            if at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if at > to {
                return false;
            }
        }
        true
    }
}

/// Filter and pagination for entry history queries.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryFilter {
    /// 1-based page number
    pub page: u32,
    /// Items per page
    pub limit: u32,
    pub date_range: Option<DateRange>,
    pub category_id: Option<String>,
    pub entry_type: Option<EntryType>,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            date_range: None,
            category_id: None,
            entry_type: None,
        }
    }
}

/// One page of a history query, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    /// Total matching items across all pages
    pub total: u64,
}

impl<T> HistoryPage<T> {
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.limit) < self.total
    }
}

/// One operation in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    AddEntry(RewardEntry),
    UpdateEntry(RewardEntry),
    DeleteEntry {
        entry_id: String,
        requesting_user_id: String,
    },
    AddCategory {
        owner_id: String,
        category: RewardCategory,
    },
    UpdateCategory {
        owner_id: String,
        category: RewardCategory,
    },
    DeleteCategory {
        owner_id: String,
        category_id: String,
    },
    AddRedemption(RedemptionTransaction),
    UpdateRedemption(RedemptionTransaction),
    DeleteRedemption {
        id: String,
        requesting_user_id: String,
    },
}

/// A local mutation not yet acknowledged by the remote store.
///
/// `record` is `None` for deletions; `base_version` is the remote version
/// the local copy last observed (`None` when the remote has never seen the
/// record).
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub key: RecordKey,
    pub record: Option<LedgerRecord>,
    pub base_version: Option<u64>,
}

/// A versioned record (or deletion) pulled from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub key: RecordKey,
    /// `None` means the record was deleted remotely
    pub record: Option<LedgerRecord>,
    pub version: u64,
    pub changed_at: DateTime<Utc>,
}
