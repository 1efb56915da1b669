//! Domain entities and their validation rules.
//!
//! Every constructor and mutator returns `Result<Entity>`; no partially
//! valid entity is ever observable. Entities are value-like: mutation
//! produces a new instance and the caller replaces its copy.

mod achievement;
mod category;
mod entry;
mod goal;
mod redemption;
mod stats;

pub use achievement::Achievement;
pub use category::{CategoryPatch, RewardCategory};
pub use entry::{EntryPatch, EntryType, RewardEntry, ENTRY_EDIT_WINDOW_HOURS, MAX_ENTRY_POINTS};
pub use goal::{Goal, GoalType};
pub use redemption::{
    RedemptionPatch, RedemptionStatus, RedemptionTransaction, MAX_REDEMPTION_POINTS,
    MIN_REDEMPTION_POINTS,
};
pub use stats::RedemptionStats;

use crate::error::{LedgerError, Result};

/// Trim `value` and reject it when empty.
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Trim an optional string, collapsing empty-after-trim to `None`.
pub(crate) fn trim_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
