//! Storage abstraction for billing state.
//!
//! Services depend on these traits rather than on Postgres directly so the
//! same reconciliation and entitlement logic runs against [`crate::PgStore`]
//! in production and [`crate::memory::InMemoryStore`] in tests.
//!
//! Every method that touches more than one record is atomic: either all of
//! its writes are visible afterwards or none are.

use async_trait::async_trait;
use finplan_shared::{
    Goal, NewGoal, NewSubscription, NewTransaction, PlanTier, Subscription, SubscriptionStatus,
    SubscriptionUpdate, Transaction, User, UserUpdate,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::audit::NewAuditEvent;
use crate::error::BillingResult;

/// A delivery left in `processing` longer than this was abandoned mid-flight
/// and may be reclaimed by a redelivery
pub const STALE_PROCESSING_MINUTES: i32 = 30;

/// A guarded status change on one subscription.
///
/// The write only lands when the stored record still has `expected_status`
/// and `expected_last_event_at`; otherwise the store reports
/// [`CommitOutcome::Conflict`] and nothing changes. In the same transaction
/// the owning user's plan is re-derived from whichever of their
/// subscriptions is Active afterwards (Free when none is).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub expected_status: SubscriptionStatus,
    pub expected_last_event_at: Option<OffsetDateTime>,
    pub update: SubscriptionUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed {
        subscription: Subscription,
        user_plan: PlanTier,
    },
    /// The record moved underneath us; re-read and decide again.
    Conflict,
}

/// Result of a quota-checked insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation<T> {
    Reserved(T),
    Denied(String),
}

/// Processing state of a received webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Processing,
    Success,
    Ignored,
    Failed,
    DeadLetter,
}

impl std::fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookEventStatus::Processing => write!(f, "processing"),
            WebhookEventStatus::Success => write!(f, "success"),
            WebhookEventStatus::Ignored => write!(f, "ignored"),
            WebhookEventStatus::Failed => write!(f, "failed"),
            WebhookEventStatus::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// Result of trying to take ownership of a webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// This caller owns processing; `attempts` includes the current one.
    Claimed { attempts: i32 },
    /// Another delivery already finished this event, or is still inside the
    /// processing window.
    AlreadyHandled(WebhookEventStatus),
}

/// Stored webhook delivery, as listed for dead-letter review
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub stripe_event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Subscription Store Adapter
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Cheap reachability check used by readiness checks
    async fn ping(&self) -> BillingResult<()>;

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>>;

    /// Apply a partial update; returns false when the user does not exist
    async fn update_user(&self, user_id: Uuid, update: &UserUpdate) -> BillingResult<bool>;

    /// Insert a new record. Fails with `AlreadySubscribed` when the record is
    /// Active and the user already has an Active subscription.
    async fn create_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription>;

    async fn find_active_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Most recently started subscription regardless of status
    async fn find_latest_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_by_external_ref(&self, external_ref: &str)
        -> BillingResult<Option<Subscription>>;

    /// Guarded status update plus user plan re-derivation, in one transaction.
    async fn update_status(&self, transition: &StatusTransition) -> BillingResult<CommitOutcome>;

    /// Append to the billing audit log
    async fn append_audit_event(&self, event: &NewAuditEvent) -> BillingResult<Uuid>;
}

/// Usage counting and quota-subject inserts
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn user_plan(&self, user_id: Uuid) -> BillingResult<Option<PlanTier>>;

    /// Transactions dated within `[first_day, last_day]`
    async fn count_transactions_between(
        &self,
        user_id: Uuid,
        first_day: Date,
        last_day: Date,
    ) -> BillingResult<u64>;

    async fn count_goals(&self, user_id: Uuid) -> BillingResult<u64>;

    async fn insert_transaction(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
    ) -> BillingResult<Transaction>;

    async fn insert_goal(&self, user_id: Uuid, new: &NewGoal) -> BillingResult<Goal>;

    /// Count-then-insert under a per-user lock so concurrent creations cannot
    /// overshoot the limit.
    async fn insert_transaction_checked(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
        now: OffsetDateTime,
    ) -> BillingResult<Reservation<Transaction>>;

    async fn insert_goal_checked(
        &self,
        user_id: Uuid,
        new: &NewGoal,
    ) -> BillingResult<Reservation<Goal>>;

    /// Add `delta_cents` to a goal in a single write. `None` when the goal
    /// does not exist or belongs to someone else.
    async fn increment_goal_progress(
        &self,
        user_id: Uuid,
        goal_id: Uuid,
        delta_cents: i64,
    ) -> BillingResult<Option<Goal>>;
}

/// Idempotency and dead-letter bookkeeping for webhook deliveries
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Atomically claim an event id. A failed event may be reclaimed, as may
    /// one stuck in `processing` past [`STALE_PROCESSING_MINUTES`]; a finished
    /// one may not.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<WebhookClaim>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        error: Option<&str>,
    ) -> BillingResult<()>;

    async fn list_dead_letters(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Deliveries still `processing` whose last attempt is older than
    /// [`STALE_PROCESSING_MINUTES`], oldest first
    async fn list_stuck_processing(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Delete finished (success/ignored) deliveries older than `days`.
    /// Dead letters are kept.
    async fn purge_webhook_events(&self, days: i32) -> BillingResult<u64>;
}
