//! Billing Invariants
//!
//! Read-only consistency checks over stored billing state. The worker runs
//! them on a schedule; any violation means a bug or a manual edit, since the
//! reconciler maintains every one of these on its own.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::STALE_PROCESSING_MINUTES;

/// Pending subscriptions older than this never saw a payment event
const STALE_PENDING_HOURS: i32 = 48;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlements are wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: Uuid,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanMismatchRow {
    user_id: Uuid,
    user_plan: String,
    expected_plan: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRefRow {
    user_id: Uuid,
    subscription_id: Uuid,
    stripe_subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterCountRow {
    dead_letters: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckDeliveryRow {
    stripe_event_id: String,
    event_type: String,
    attempts: i32,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: At most one Active subscription per user
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS active_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions (expected at most 1)",
                    row.active_count
                ),
                context: serde_json::json!({ "active_count": row.active_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: The user's plan equals the Active subscription's plan, or
    /// Free when nothing is Active
    async fn check_plan_matches_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                u.id AS user_id,
                u.plan::text AS user_plan,
                COALESCE(s.plan, 'free')::text AS expected_plan
            FROM users u
            LEFT JOIN subscriptions s
              ON s.user_id = u.id AND s.status = 'active'
            WHERE u.plan <> COALESCE(s.plan, 'free')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_matches_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User is on plan '{}' but subscriptions say '{}'",
                    row.user_plan, row.expected_plan
                ),
                context: serde_json::json!({
                    "user_plan": row.user_plan,
                    "expected_plan": row.expected_plan,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Active subscriptions know when their paid period ends
    async fn check_active_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubscriptionRefRow> = sqlx::query_as(
            r#"
            SELECT user_id, id AS subscription_id, stripe_subscription_id
            FROM subscriptions
            WHERE status = 'active' AND end_date IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_end_date".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription has no end date".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Pending subscriptions resolve within a couple of days
    async fn check_stale_pending(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SubscriptionRefRow> = sqlx::query_as(
            r#"
            SELECT user_id, id AS subscription_id, stripe_subscription_id
            FROM subscriptions
            WHERE status = 'pending'
              AND start_date < NOW() - make_interval(hours => $1)
            "#,
        )
        .bind(STALE_PENDING_HOURS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_resolves".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription pending for more than {} hours",
                    STALE_PENDING_HOURS
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 5: No webhook deliveries are parked in the dead letter table
    async fn check_no_dead_letters(&self) -> BillingResult<Vec<InvariantViolation>> {
        let row: DeadLetterCountRow = sqlx::query_as(
            "SELECT COUNT(*) AS dead_letters FROM billing_webhook_events WHERE status = 'dead_letter'",
        )
        .fetch_one(&self.pool)
        .await?;

        if row.dead_letters == 0 {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "no_dead_letter_webhooks".to_string(),
            user_ids: vec![],
            description: format!(
                "{} webhook deliveries exhausted their retries",
                row.dead_letters
            ),
            context: serde_json::json!({ "dead_letters": row.dead_letters }),
            severity: ViolationSeverity::High,
        }])
    }

    /// Invariant 6: No webhook delivery sits in `processing` past the
    /// reclaim window. Such a row was claimed by a delivery that never
    /// finished and only a Stripe redelivery will pick it up again.
    async fn check_no_stuck_processing(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckDeliveryRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, attempts
            FROM billing_webhook_events
            WHERE status = 'processing'
              AND last_attempt_at < NOW() - make_interval(mins => $1)
            ORDER BY last_attempt_at ASC
            "#,
        )
        .bind(STALE_PROCESSING_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(vec![]);
        }

        let events: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "attempts": row.attempts,
                })
            })
            .collect();

        Ok(vec![InvariantViolation {
            invariant: "no_stuck_processing_webhooks".to_string(),
            user_ids: vec![],
            description: format!(
                "{} webhook deliveries stuck in processing for more than {} minutes",
                rows.len(),
                STALE_PROCESSING_MINUTES
            ),
            context: serde_json::json!({ "events": events }),
            severity: ViolationSeverity::High,
        }])
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "plan_matches_subscription" => self.check_plan_matches_subscription().await,
            "active_has_end_date" => self.check_active_has_end_date().await,
            "pending_resolves" => self.check_stale_pending().await,
            "no_dead_letter_webhooks" => self.check_no_dead_letters().await,
            "no_stuck_processing_webhooks" => self.check_no_stuck_processing().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "plan_matches_subscription",
            "active_has_end_date",
            "pending_resolves",
            "no_dead_letter_webhooks",
            "no_stuck_processing_webhooks",
        ]
    }
}
