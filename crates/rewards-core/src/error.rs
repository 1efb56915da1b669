//! Error types for ledger core operations.
//!
//! This module defines the failure taxonomy for all core operations.
//! Every fallible path returns a typed failure through [`Result`]; nothing
//! in the core panics on bad input. Validation failures embed the violated
//! business-rule code (e.g. "BR-008") in their message so callers and tests
//! can assert on it.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Business-rule identifiers referenced by validation messages.
pub mod rules {
    /// Per-entry point magnitude cap (|points| <= 10,000).
    pub const ENTRY_POINTS_RANGE: &str = "BR-002";
    /// Reward entries are mutable only within 24 hours of creation.
    pub const ENTRY_EDIT_WINDOW: &str = "BR-004";
    /// Redemption size bounds (100 <= points_used <= 1,000,000).
    pub const REDEMPTION_POINTS_RANGE: &str = "BR-008";
    /// Finalized redemption transactions never change status again.
    pub const REDEMPTION_FINAL: &str = "BR-009";
    /// At most 20 custom categories per user.
    pub const CATEGORY_CAP: &str = "BR-014";
}

/// Core error type for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Input violates a stated business rule
    #[error("Validation error: {0}")]
    Validation(String),

    /// Illegal transition on a finite-state entity
    #[error("State error: cannot move from '{current}' to '{attempted}'")]
    State { current: String, attempted: String },

    /// Actor does not own the target resource
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Referenced id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store was unreachable or returned an infrastructure error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation was cancelled before completion
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A batch failed and its compensating rollback also failed
    #[error("Partial application risk: {0}")]
    PartialApplication(String),
}

impl LedgerError {
    /// Build a validation error tagged with a business-rule code.
    pub fn rule(rule: &str, message: impl Into<String>) -> Self {
        LedgerError::Validation(format!("{}: {}", rule, message.into()))
    }

    /// Build an untagged validation error (no numbered rule exists).
    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    /// Build a state error naming the current and attempted status.
    pub fn state(current: impl ToString, attempted: impl ToString) -> Self {
        LedgerError::State {
            current: current.to_string(),
            attempted: attempted.to_string(),
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_code_appears_in_message() {
        let err = LedgerError::rule(rules::REDEMPTION_POINTS_RANGE, "points_used below minimum");
        assert!(err.to_string().contains("BR-008"));
    }

    #[test]
    fn test_state_error_names_both_statuses() {
        let err = LedgerError::state("completed", "cancelled");
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("cancelled"));
    }
}
