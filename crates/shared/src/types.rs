//! Common types used across Finplan

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::FinplanError;

// =============================================================================
// Enums
// =============================================================================

/// Billing plan tier of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Business,
}

impl PlanTier {
    /// Tiers that can be purchased through the payment processor
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Parse a tier a user is allowed to purchase (Free is never purchasable)
    pub fn parse_paid(s: &str) -> Result<Self, FinplanError> {
        let tier: PlanTier = s.parse()?;
        if tier.is_paid() {
            Ok(tier)
        } else {
            Err(FinplanError::Validation(format!(
                "Plan '{}' cannot be purchased",
                s
            )))
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Business => write!(f, "business"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = FinplanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            _ => Err(FinplanError::UnknownPlan(s.to_string())),
        }
    }
}

/// Lifecycle state of a paid-plan subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    /// Canceled and Expired records are kept for audit and never resurrected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Canceled => write!(f, "canceled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = FinplanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            _ => Err(FinplanError::UnknownStatus(s.to_string())),
        }
    }
}

/// Payment method tag recorded on a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    Pix,
    BankTransfer,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreditCard => write!(f, "credit_card"),
            Self::Pix => write!(f, "pix"),
            Self::BankTransfer => write!(f, "bank_transfer"),
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = FinplanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "credit_card" => Ok(Self::CreditCard),
            "pix" => Ok(Self::Pix),
            "bank_transfer" => Ok(Self::BankTransfer),
            _ => Err(FinplanError::UnknownPaymentMethod(s.to_string())),
        }
    }
}

/// Direction of a money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

/// Goal priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GoalPriority {
    Low,
    #[default]
    Medium,
    High,
}

// =============================================================================
// Database Models
// =============================================================================

/// User model (only the billing-relevant columns)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    /// Denormalized copy of the Active subscription's tier, Free when none
    pub plan: PlanTier,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Subscription model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub payment_method: PaymentMethod,
    pub stripe_subscription_id: String,
    /// Processor timestamp of the last event applied to this record
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
}

/// Fields for inserting a new subscription record
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub payment_method: PaymentMethod,
    pub stripe_subscription_id: String,
}

/// Transaction model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub category: String,
    pub description: Option<String>,
    pub date: Date,
    pub recurring: bool,
}

/// Goal model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Goal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub target_amount_cents: i64,
    pub current_amount_cents: i64,
    pub target_date: Date,
    pub priority: GoalPriority,
}

/// In-app notification model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub message: String,
    pub read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Request Types
// =============================================================================

/// Create transaction request
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub category: String,
    pub description: Option<String>,
    pub date: Date,
    #[serde(default)]
    pub recurring: bool,
}

impl NewTransaction {
    pub fn validate(&self) -> Result<(), FinplanError> {
        if self.amount_cents <= 0 {
            return Err(FinplanError::Validation(
                "amount_cents must be positive".to_string(),
            ));
        }
        if self.category.trim().is_empty() {
            return Err(FinplanError::Validation("category is required".to_string()));
        }
        Ok(())
    }
}

/// Create goal request
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewGoal {
    pub name: String,
    pub target_amount_cents: i64,
    #[serde(default)]
    pub current_amount_cents: i64,
    pub target_date: Date,
    #[serde(default)]
    pub priority: GoalPriority,
}

impl NewGoal {
    pub fn validate(&self) -> Result<(), FinplanError> {
        if self.name.trim().is_empty() {
            return Err(FinplanError::Validation("name is required".to_string()));
        }
        if self.target_amount_cents <= 0 {
            return Err(FinplanError::Validation(
                "target_amount_cents must be positive".to_string(),
            ));
        }
        if self.current_amount_cents < 0 {
            return Err(FinplanError::Validation(
                "current_amount_cents cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Partial Updates
// =============================================================================

/// Enumerated partial update for a user row. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub stripe_customer_id: Option<String>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.stripe_customer_id.is_none()
    }
}

/// Enumerated partial update for a subscription row. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionUpdate {
    pub plan: Option<PlanTier>,
    pub status: Option<SubscriptionStatus>,
    pub end_date: Option<OffsetDateTime>,
    pub last_event_at: Option<OffsetDateTime>,
}

impl SubscriptionUpdate {
    /// Apply the named fields onto an existing record
    pub fn apply_to(&self, subscription: &mut Subscription) {
        if let Some(plan) = self.plan {
            subscription.plan = plan;
        }
        if let Some(status) = self.status {
            subscription.status = status;
        }
        if let Some(end_date) = self.end_date {
            subscription.end_date = Some(end_date);
        }
        if let Some(last_event_at) = self.last_event_at {
            subscription.last_event_at = Some(last_event_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_plan_tier_round_trip_names() {
        assert_eq!("pro".parse::<PlanTier>(), Ok(PlanTier::Pro));
        assert_eq!("BUSINESS".parse::<PlanTier>(), Ok(PlanTier::Business));
        assert_eq!(PlanTier::Free.to_string(), "free");
        assert_eq!(
            "gold".parse::<PlanTier>(),
            Err(FinplanError::UnknownPlan("gold".to_string()))
        );
    }

    #[test]
    fn test_parse_paid_rejects_free() {
        assert_eq!(PlanTier::parse_paid("business"), Ok(PlanTier::Business));
        assert!(matches!(
            PlanTier::parse_paid("free"),
            Err(FinplanError::Validation(_))
        ));
        assert!(matches!(
            PlanTier::parse_paid("platinum"),
            Err(FinplanError::UnknownPlan(_))
        ));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
        assert!(!SubscriptionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_payment_method_serde_names() {
        let parsed: PaymentMethod = serde_json::from_str("\"bank_transfer\"").unwrap();
        assert_eq!(parsed, PaymentMethod::BankTransfer);
        assert_eq!("pix".parse::<PaymentMethod>(), Ok(PaymentMethod::Pix));
        assert_eq!(PaymentMethod::CreditCard.to_string(), "credit_card");
    }

    #[test]
    fn test_subscription_update_rejects_unknown_keys() {
        let result = serde_json::from_str::<SubscriptionUpdate>(
            r#"{"status": "active", "stripe_subscription_id": "sub_x"}"#,
        );
        assert!(result.is_err());

        let result = serde_json::from_str::<UserUpdate>(r#"{"plan": "pro"}"#);
        assert!(result.is_err(), "plan is owned by reconciliation, not user updates");
    }

    #[test]
    fn test_subscription_update_applies_named_fields_only() {
        let mut sub = Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan: PlanTier::Pro,
            status: SubscriptionStatus::Pending,
            start_date: datetime!(2024-01-01 0:00 UTC),
            end_date: None,
            payment_method: PaymentMethod::Pix,
            stripe_subscription_id: "sub_1".to_string(),
            last_event_at: None,
        };

        SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            end_date: Some(datetime!(2024-01-31 0:00 UTC)),
            ..Default::default()
        }
        .apply_to(&mut sub);

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan, PlanTier::Pro);
        assert_eq!(sub.end_date, Some(datetime!(2024-01-31 0:00 UTC)));
        assert_eq!(sub.last_event_at, None);
    }

    #[test]
    fn test_new_transaction_validation() {
        let mut tx = NewTransaction {
            kind: TransactionKind::Expense,
            amount_cents: 1250,
            category: "groceries".to_string(),
            description: None,
            date: date!(2024 - 02 - 29),
            recurring: false,
        };
        assert!(tx.validate().is_ok());

        tx.amount_cents = 0;
        assert!(tx.validate().is_err());

        tx.amount_cents = 10;
        tx.category = "  ".to_string();
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_new_goal_rejects_unknown_fields() {
        let result = serde_json::from_str::<NewGoal>(
            r#"{"name": "Trip", "target_amount_cents": 100, "target_date": "2025-01-01", "user_id": "x"}"#,
        );
        assert!(result.is_err());
    }
}
