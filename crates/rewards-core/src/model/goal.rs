//! Savings-style goals a user works toward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{require_non_empty, trim_optional};
use crate::error::{LedgerError, Result};

const MAX_TITLE_CHARS: usize = 100;

/// What a goal's target counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    /// Accumulate a point balance
    PointsTarget,
    /// Redeem a number of rewards
    RewardTarget,
}

/// A target a user is working toward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub target_value: i64,
    pub current_value: i64,
    pub goal_type: GoalType,
    /// Optional category the goal is scoped to
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub target_date: Option<DateTime<Utc>>,
    /// Display styling
    pub color: String,
    pub icon: String,
    /// Explicit completion marker, set independently of the value check
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        user_id: &str,
        title: &str,
        description: Option<&str>,
        target_value: i64,
        goal_type: GoalType,
        category: Option<&str>,
        created_at: DateTime<Utc>,
        target_date: Option<DateTime<Utc>>,
        color: &str,
        icon: &str,
    ) -> Result<Self> {
        let id = require_non_empty("goal id", &id.into())?;
        let user_id = require_non_empty("user id", user_id)?;
        let title = require_non_empty("goal title", title)?;
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(LedgerError::validation(format!(
                "goal title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }
        if target_value <= 0 {
            return Err(LedgerError::validation("goal target must be positive"));
        }
        Ok(Self {
            id,
            user_id,
            title,
            description: trim_optional(description),
            target_value,
            current_value: 0,
            goal_type,
            category: trim_optional(category),
            created_at,
            target_date,
            color: color.trim().to_string(),
            icon: icon.trim().to_string(),
            completed_at: None,
        })
    }

    /// Completed when explicitly marked or when the current value reached
    /// the target.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some() || self.current_value >= self.target_value
    }

    pub fn is_active(&self) -> bool {
        !self.is_completed()
    }

    /// Progress toward the target, clamped to 0..=100.
    pub fn progress_percent(&self) -> f64 {
        let pct = self.current_value as f64 / self.target_value as f64 * 100.0;
        pct.clamp(0.0, 100.0)
    }

    /// Return a copy with `delta` applied to the current value.
    ///
    /// The current value never goes negative.
    pub fn record_progress(&self, delta: i64) -> Result<Self> {
        let next_value = self
            .current_value
            .checked_add(delta)
            .ok_or_else(|| LedgerError::validation("goal progress overflow"))?;
        if next_value < 0 {
            return Err(LedgerError::validation(
                "goal progress cannot go below zero",
            ));
        }
        Ok(Self {
            current_value: next_value,
            ..self.clone()
        })
    }

    /// Return a copy explicitly marked complete.
    pub fn mark_completed(&self, now: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(now),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn goal() -> Goal {
        Goal::new(
            "g-1",
            "user-1",
            "Bike fund",
            Some("new bike"),
            1000,
            GoalType::PointsTarget,
            None,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            None,
            "#00AA00",
            "bicycle",
        )
        .expect("valid goal")
    }

    #[test]
    fn test_target_must_be_positive() {
        for bad in [0, -5] {
            assert!(Goal::new(
                "g",
                "u",
                "t",
                None,
                bad,
                GoalType::PointsTarget,
                None,
                Utc::now(),
                None,
                "",
                "",
            )
            .is_err());
        }
    }

    #[test]
    fn test_completion_derivation() {
        let g = goal();
        assert!(g.is_active());

        let progressed = g.record_progress(1000).unwrap();
        assert!(progressed.is_completed());
        assert_eq!(progressed.progress_percent(), 100.0);

        let marked = g.mark_completed(Utc::now());
        assert!(marked.is_completed());
        assert_eq!(marked.current_value, 0);
    }

    #[test]
    fn test_progress_never_negative() {
        let g = goal().record_progress(50).unwrap();
        assert!(g.record_progress(-100).is_err());
        assert_eq!(g.record_progress(-50).unwrap().current_value, 0);
    }
}
