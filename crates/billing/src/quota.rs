//! Quota Evaluator
//!
//! Pure decision function for plan limits. Given a plan tier, a feature and
//! the caller's current usage it answers whether one more creation is
//! allowed. Nothing here touches storage; the entitlement gate supplies the
//! usage count and the calendar window.
//!
//! ## Limits
//!
//! | Tier     | Transactions           | Goals     |
//! |----------|------------------------|-----------|
//! | Free     | 100 per calendar month | 3 total   |
//! | Pro      | unlimited              | unlimited |
//! | Business | unlimited              | unlimited |

use std::str::FromStr;

use finplan_shared::PlanTier;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

/// Free tier: transactions per calendar month (UTC)
pub const FREE_MONTHLY_TRANSACTIONS: u64 = 100;

/// Free tier: goals in total, regardless of age
pub const FREE_TOTAL_GOALS: u64 = 3;

/// A capability subject to plan limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaFeature {
    Transactions,
    Goals,
}

impl std::fmt::Display for QuotaFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaFeature::Transactions => write!(f, "transactions"),
            QuotaFeature::Goals => write!(f, "goals"),
        }
    }
}

impl FromStr for QuotaFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transactions" => Ok(QuotaFeature::Transactions),
            "goals" => Ok(QuotaFeature::Goals),
            other => Err(format!("unknown feature: {}", other)),
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum QuotaDecision {
    Allowed,
    Denied(String),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

/// Inclusive calendar-month window a usage count is taken over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthWindow {
    pub first_day: Date,
    pub last_day: Date,
}

/// Calendar month containing `now`, evaluated in UTC.
pub fn month_window(now: OffsetDateTime) -> MonthWindow {
    let today = now.to_offset(time::UtcOffset::UTC).date();
    let first_day = today.replace_day(1).unwrap_or(today);
    let days = time::util::days_in_year_month(first_day.year(), first_day.month());
    let last_day = first_day.replace_day(days).unwrap_or(first_day);
    MonthWindow {
        first_day,
        last_day,
    }
}

/// Limit applied to `feature` on `tier`, `None` meaning unlimited.
pub fn limit_for(tier: PlanTier, feature: QuotaFeature) -> Option<u64> {
    match (tier, feature) {
        (PlanTier::Free, QuotaFeature::Transactions) => Some(FREE_MONTHLY_TRANSACTIONS),
        (PlanTier::Free, QuotaFeature::Goals) => Some(FREE_TOTAL_GOALS),
        (PlanTier::Pro | PlanTier::Business, _) => None,
    }
}

/// Decide whether one more `feature` item fits under `tier` given `usage`.
pub fn evaluate(tier: PlanTier, feature: QuotaFeature, usage: u64) -> QuotaDecision {
    match limit_for(tier, feature) {
        None => QuotaDecision::Allowed,
        Some(limit) if usage < limit => QuotaDecision::Allowed,
        Some(limit) => QuotaDecision::Denied(denial_reason(feature, limit)),
    }
}

/// Like [`evaluate`] for a feature named at runtime. Unknown names are denied.
pub fn evaluate_named(tier: PlanTier, feature: &str, usage: u64) -> QuotaDecision {
    match feature.parse::<QuotaFeature>() {
        Ok(feature) => evaluate(tier, feature, usage),
        Err(reason) => QuotaDecision::Denied(reason),
    }
}

fn denial_reason(feature: QuotaFeature, limit: u64) -> String {
    match feature {
        QuotaFeature::Transactions => format!(
            "Free plan allows {} transactions per month. Upgrade to add more.",
            limit
        ),
        QuotaFeature::Goals => format!(
            "Free plan allows {} goals. Upgrade to add more.",
            limit
        ),
    }
}
