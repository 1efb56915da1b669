//! Reward entries: the individual point movements in the ledger.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::require_non_empty;
use crate::error::{rules, LedgerError, Result};

/// Per-entry point magnitude cap (BR-002).
pub const MAX_ENTRY_POINTS: i64 = 10_000;

/// Entries are mutable for this long after creation (BR-004).
pub const ENTRY_EDIT_WINDOW_HOURS: i64 = 24;

/// How an entry's points came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Earned,
    Adjusted,
    Bonus,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Earned => "earned",
            EntryType::Adjusted => "adjusted",
            EntryType::Bonus => "bonus",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "earned" => Ok(EntryType::Earned),
            "adjusted" => Ok(EntryType::Adjusted),
            "bonus" => Ok(EntryType::Bonus),
            other => Err(LedgerError::validation(format!(
                "unknown entry type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signed point movement for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardEntry {
    /// Unique identifier
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// Signed point delta, |points| <= 10,000 (BR-002)
    pub points: i64,

    /// What the points were for
    pub description: String,

    /// Category this entry is filed under
    pub category_id: String,

    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// How the points came to be
    pub entry_type: EntryType,

    /// Whether this entry has been acknowledged by the remote store
    pub is_synced: bool,
}

/// Changed fields for [`RewardEntry::update`].
#[derive(Debug, Default, Clone)]
pub struct EntryPatch {
    pub points: Option<i64>,
    pub description: Option<String>,
    pub category_id: Option<String>,
    pub entry_type: Option<EntryType>,
}

impl RewardEntry {
    /// Construct a validated entry.
    ///
    /// Category existence is a store-level concern and is not checked here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        user_id: &str,
        points: i64,
        description: &str,
        category_id: &str,
        entry_type: EntryType,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let id = require_non_empty("entry id", &id.into())?;
        let user_id = require_non_empty("user id", user_id)?;
        let category_id = require_non_empty("category id", category_id)?;
        validate_points(points)?;
        Ok(Self {
            id,
            user_id,
            points,
            description: description.trim().to_string(),
            category_id,
            created_at,
            entry_type,
            is_synced: false,
        })
    }

    /// Whether the entry is still inside its edit window at `now` (BR-004).
    pub fn can_modify(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at <= Duration::hours(ENTRY_EDIT_WINDOW_HOURS)
    }

    /// Return a copy with the patched fields.
    ///
    /// Fails with a BR-004 validation error when the edit window has passed,
    /// and re-validates any changed field.
    pub fn update(&self, patch: EntryPatch, now: DateTime<Utc>) -> Result<Self> {
        if !self.can_modify(now) {
            return Err(LedgerError::rule(
                rules::ENTRY_EDIT_WINDOW,
                format!(
                    "entry {} is older than {ENTRY_EDIT_WINDOW_HOURS}h and can no longer be modified",
                    self.id
                ),
            ));
        }
        let mut next = self.clone();
        if let Some(points) = patch.points {
            validate_points(points)?;
            next.points = points;
        }
        if let Some(description) = patch.description {
            next.description = description.trim().to_string();
        }
        if let Some(category_id) = patch.category_id {
            next.category_id = require_non_empty("category id", &category_id)?;
        }
        if let Some(entry_type) = patch.entry_type {
            next.entry_type = entry_type;
        }
        next.is_synced = false;
        Ok(next)
    }

    /// Copy with the synced flag set; used by stores when the remote store
    /// acknowledges the entry.
    pub fn mark_synced(&self) -> Self {
        Self {
            is_synced: true,
            ..self.clone()
        }
    }
}

fn validate_points(points: i64) -> Result<()> {
    if points.abs() > MAX_ENTRY_POINTS {
        return Err(LedgerError::rule(
            rules::ENTRY_POINTS_RANGE,
            format!("entry points magnitude {points} exceeds {MAX_ENTRY_POINTS}"),
        ));
    }
    Ok(())
}
