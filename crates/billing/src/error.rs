//! Billing error types

use finplan_shared::FinplanError;
use thiserror::Error;
use uuid::Uuid;

/// Name of the partial unique index that allows one active subscription per user.
pub const ONE_ACTIVE_PER_USER_CONSTRAINT: &str = "subscriptions_one_active_per_user";

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid subscription tier: {0}")]
    InvalidTier(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Plan limit reached: {0}")]
    QuotaExceeded(String),

    #[error("User already has an active subscription")]
    AlreadySubscribed,

    #[error("No active subscription found")]
    NoActiveSubscription,

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    /// The subscription write landed but the user plan write did not; the
    /// transaction was rolled back and the event must be retried.
    #[error("Partial commit for subscription {subscription_id}: {reason}")]
    PartialCommit { subscription_id: Uuid, reason: String },
}

/// Coarse classification used by callers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller sent something we will never accept
    Validation,
    /// Caller is well-formed but not allowed right now
    EntitlementDenied,
    /// Referenced entity does not exist
    NotFound,
    /// Safe to retry as-is
    Transient,
    /// A multi-record write was rolled back halfway; retry the whole event
    PartialCommit,
    Internal,
}

impl BillingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BillingError::InvalidInput(_)
            | BillingError::InvalidTier(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::WebhookPayload(_) => ErrorClass::Validation,
            BillingError::QuotaExceeded(_)
            | BillingError::AlreadySubscribed
            | BillingError::NoActiveSubscription => ErrorClass::EntitlementDenied,
            BillingError::NotFound(_) | BillingError::SubscriptionNotFound(_) => {
                ErrorClass::NotFound
            }
            BillingError::StripeApi(_)
            | BillingError::Database(_)
            | BillingError::ConcurrentModification(_) => ErrorClass::Transient,
            BillingError::PartialCommit { .. } => ErrorClass::PartialCommit,
            BillingError::Config(_) | BillingError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Worth retrying inside the same request (re-read and re-decide).
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Worth asking the delivery mechanism to redeliver.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::PartialCommit
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation()
                && db_err.constraint() == Some(ONE_ACTIVE_PER_USER_CONSTRAINT)
            {
                return BillingError::AlreadySubscribed;
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<FinplanError> for BillingError {
    fn from(err: FinplanError) -> Self {
        match err {
            FinplanError::UnknownPlan(plan) => BillingError::InvalidTier(plan),
            FinplanError::NotFound(what) => BillingError::NotFound(what),
            FinplanError::Internal(msg) => BillingError::Internal(msg),
            other => BillingError::InvalidInput(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
