//! Redemption transactions and their status state machine.
//!
//! A redemption starts `pending` and moves to exactly one of the final
//! statuses (`completed`, `cancelled`, `expired`). Once final, no further
//! status change is permitted (BR-009); [`RedemptionTransaction::copy_with`]
//! is the single enforcement point for that rule.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{require_non_empty, trim_optional};
use crate::clock::{Clock, IdGenerator};
use crate::error::{rules, LedgerError, Result};

/// Minimum redemption size (BR-008).
pub const MIN_REDEMPTION_POINTS: i64 = 100;

/// Maximum redemption size (BR-008).
pub const MAX_REDEMPTION_POINTS: i64 = 1_000_000;

/// Lifecycle status of a redemption transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Completed,
    Cancelled,
    Expired,
}

impl RedemptionStatus {
    /// Whether no further transition is permitted from this status.
    pub fn is_final(&self) -> bool {
        !matches!(self, RedemptionStatus::Pending)
    }

    /// Whether a transaction in this status may be cancelled.
    pub fn can_be_cancelled(&self) -> bool {
        matches!(self, RedemptionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Cancelled => "cancelled",
            RedemptionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(RedemptionStatus::Pending),
            "completed" => Ok(RedemptionStatus::Completed),
            "cancelled" => Ok(RedemptionStatus::Cancelled),
            "expired" => Ok(RedemptionStatus::Expired),
            other => Err(LedgerError::validation(format!(
                "unknown redemption status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spend of accumulated points against a reward option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionTransaction {
    /// Unique identifier
    pub id: String,

    /// Owning user
    pub user_id: String,

    /// The reward option being redeemed
    pub option_id: String,

    /// Points spent, 100..=1,000,000 (BR-008)
    pub points_used: i64,

    /// When the redemption was requested
    pub redeemed_at: DateTime<Utc>,

    /// Lifecycle status
    pub status: RedemptionStatus,

    /// Free-form notes; cancel() stores the reason here
    pub notes: Option<String>,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// Last mutation, if any
    pub updated_at: Option<DateTime<Utc>>,

    /// Set when the transaction completed
    pub completed_at: Option<DateTime<Utc>>,

    /// Set when the transaction was cancelled
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Changed fields for [`RedemptionTransaction::copy_with`].
#[derive(Debug, Default, Clone)]
pub struct RedemptionPatch {
    pub status: Option<RedemptionStatus>,
    pub points_used: Option<i64>,
    /// Outer level: change the field; inner: the new value or `None` to clear.
    pub notes: Option<Option<String>>,
}

impl RedemptionTransaction {
    /// Create a new pending redemption.
    ///
    /// The id comes from the injected generator; `redeemed_at` and
    /// `created_at` are both set to the clock's now.
    pub fn create(
        user_id: &str,
        option_id: &str,
        points_used: i64,
        notes: Option<&str>,
        ids: &dyn IdGenerator,
        clock: &dyn Clock,
    ) -> Result<Self> {
        let user_id = require_non_empty("user id", user_id)?;
        let option_id = require_non_empty("option id", option_id)?;
        validate_points_used(points_used)?;
        let now = clock.now();
        Ok(Self {
            id: ids.next_id(),
            user_id,
            option_id,
            points_used,
            redeemed_at: now,
            status: RedemptionStatus::Pending,
            notes: trim_optional(notes),
            created_at: now,
            updated_at: None,
            completed_at: None,
            cancelled_at: None,
        })
    }

    /// Mark the redemption fulfilled.
    pub fn complete(&self, now: DateTime<Utc>) -> Result<Self> {
        if self.status != RedemptionStatus::Pending {
            return Err(LedgerError::state(self.status, RedemptionStatus::Completed));
        }
        Ok(Self {
            status: RedemptionStatus::Completed,
            completed_at: Some(now),
            updated_at: Some(now),
            ..self.clone()
        })
    }

    /// Cancel the redemption, recording the reason in `notes`.
    pub fn cancel(&self, reason: &str, now: DateTime<Utc>) -> Result<Self> {
        if !self.status.can_be_cancelled() {
            return Err(LedgerError::state(self.status, RedemptionStatus::Cancelled));
        }
        Ok(Self {
            status: RedemptionStatus::Cancelled,
            cancelled_at: Some(now),
            updated_at: Some(now),
            notes: trim_optional(Some(reason)),
            ..self.clone()
        })
    }

    /// Expire a pending redemption that was never fulfilled.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<Self> {
        if self.status != RedemptionStatus::Pending {
            return Err(LedgerError::state(self.status, RedemptionStatus::Expired));
        }
        Ok(Self {
            status: RedemptionStatus::Expired,
            updated_at: Some(now),
            ..self.clone()
        })
    }

    /// Return a copy with the patched fields.
    ///
    /// Changing the status of a finalized transaction fails with a BR-009
    /// state error; the original value is left untouched either way.
    pub fn copy_with(&self, patch: RedemptionPatch, now: DateTime<Utc>) -> Result<Self> {
        if let Some(status) = patch.status {
            if self.status.is_final() && status != self.status {
                return Err(LedgerError::State {
                    current: self.status.to_string(),
                    attempted: format!("{status} ({})", rules::REDEMPTION_FINAL),
                });
            }
        }
        let mut next = self.clone();
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(points_used) = patch.points_used {
            validate_points_used(points_used)?;
            next.points_used = points_used;
        }
        if let Some(notes) = patch.notes {
            next.notes = trim_optional(notes.as_deref());
        }
        next.updated_at = Some(now);
        Ok(next)
    }

    /// Time elapsed since creation.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == RedemptionStatus::Pending
    }

    pub fn is_successful(&self) -> bool {
        self.status == RedemptionStatus::Completed
    }
}

fn validate_points_used(points_used: i64) -> Result<()> {
    if !(MIN_REDEMPTION_POINTS..=MAX_REDEMPTION_POINTS).contains(&points_used) {
        return Err(LedgerError::rule(
            rules::REDEMPTION_POINTS_RANGE,
            format!(
                "points_used {points_used} outside {MIN_REDEMPTION_POINTS}..={MAX_REDEMPTION_POINTS}"
            ),
        ));
    }
    Ok(())
}
