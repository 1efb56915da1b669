//! Unlockable achievements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{require_non_empty, trim_optional};
use crate::error::{LedgerError, Result};

/// A badge a user can unlock once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub icon: String,
    /// Bonus points granted on unlock
    pub points_awarded: i64,
    pub created_at: DateTime<Utc>,
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl Achievement {
    pub fn new(
        id: impl Into<String>,
        user_id: &str,
        title: &str,
        description: Option<&str>,
        icon: &str,
        points_awarded: i64,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let id = require_non_empty("achievement id", &id.into())?;
        let user_id = require_non_empty("user id", user_id)?;
        let title = require_non_empty("achievement title", title)?;
        if points_awarded < 0 {
            return Err(LedgerError::validation(
                "achievement points_awarded cannot be negative",
            ));
        }
        Ok(Self {
            id,
            user_id,
            title,
            description: trim_optional(description),
            icon: icon.trim().to_string(),
            points_awarded,
            created_at,
            unlocked_at: None,
        })
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked_at.is_some()
    }

    /// Return an unlocked copy; unlocking twice is a state error.
    pub fn unlock(&self, now: DateTime<Utc>) -> Result<Self> {
        if self.is_unlocked() {
            return Err(LedgerError::state("unlocked", "unlocked"));
        }
        Ok(Self {
            unlocked_at: Some(now),
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlock_is_one_shot() {
        let a = Achievement::new("a-1", "u", "First chore", None, "star", 25, Utc::now())
            .expect("valid achievement");
        assert!(!a.is_unlocked());
        let unlocked = a.unlock(Utc::now()).expect("first unlock");
        assert!(unlocked.is_unlocked());
        assert!(unlocked.unlock(Utc::now()).is_err());
    }

    #[test]
    fn test_negative_award_rejected() {
        assert!(Achievement::new("a", "u", "t", None, "", -1, Utc::now()).is_err());
    }
}
