//! Derived redemption statistics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::redemption::{RedemptionStatus, RedemptionTransaction};

/// Read-only aggregate over a user's redemption history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedemptionStats {
    pub total_transactions: u64,
    pub completed_transactions: u64,
    pub cancelled_transactions: u64,
    pub total_points_redeemed: i64,
    pub first_redemption_at: Option<DateTime<Utc>>,
    pub last_redemption_at: Option<DateTime<Utc>>,
    pub favorite_category: Option<String>,
}

impl RedemptionStats {
    /// Aggregate a slice of transactions.
    ///
    /// `total_points_redeemed` counts completed transactions only. The
    /// favorite is the most-redeemed option; callers holding an
    /// option-to-category mapping can replace it via
    /// [`RedemptionStats::with_favorite_category`].
    pub fn from_transactions(transactions: &[RedemptionTransaction]) -> Self {
        let mut stats = RedemptionStats {
            total_transactions: transactions.len() as u64,
            ..Default::default()
        };
        let mut option_counts: HashMap<&str, u64> = HashMap::new();
        for tx in transactions {
            match tx.status {
                RedemptionStatus::Completed => {
                    stats.completed_transactions += 1;
                    stats.total_points_redeemed += tx.points_used;
                    *option_counts.entry(tx.option_id.as_str()).or_default() += 1;
                }
                RedemptionStatus::Cancelled => stats.cancelled_transactions += 1,
                _ => {}
            }
            stats.first_redemption_at = Some(match stats.first_redemption_at {
                Some(first) => first.min(tx.redeemed_at),
                None => tx.redeemed_at,
            });
            stats.last_redemption_at = Some(match stats.last_redemption_at {
                Some(last) => last.max(tx.redeemed_at),
                None => tx.redeemed_at,
            });
        }
        stats.favorite_category = option_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
            .map(|(option, _)| option.to_string());
        stats
    }

    pub fn with_favorite_category(mut self, category: impl Into<String>) -> Self {
        self.favorite_category = Some(category.into());
        self
    }

    /// Completed transactions as a percentage of all transactions.
    pub fn success_rate(&self) -> f64 {
        if self.total_transactions == 0 {
            return 0.0;
        }
        self.completed_transactions as f64 / self.total_transactions as f64 * 100.0
    }

    /// Mean points per completed redemption.
    pub fn average_points_per_redemption(&self) -> f64 {
        if self.completed_transactions == 0 {
            return 0.0;
        }
        self.total_points_redeemed as f64 / self.completed_transactions as f64
    }

    /// Transactions neither completed nor cancelled.
    pub fn pending_transactions(&self) -> u64 {
        self.total_transactions
            .saturating_sub(self.completed_transactions)
            .saturating_sub(self.cancelled_transactions)
    }

    /// Whole days between the first and last redemption; 0 when either is
    /// missing.
    pub fn activity_span_days(&self) -> i64 {
        match (self.first_redemption_at, self.last_redemption_at) {
            (Some(first), Some(last)) => (last - first).num_days(),
            _ => 0,
        }
    }
}
