//! PostgreSQL implementation of the billing storage traits

use async_trait::async_trait;
use finplan_shared::{
    Goal, NewGoal, NewSubscription, NewTransaction, PlanTier, Subscription, Transaction, User,
    UserUpdate,
};
use sqlx::{PgPool, Postgres, Transaction as DbTransaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::audit::NewAuditEvent;
use crate::error::{BillingError, BillingResult};
use crate::quota::{self, QuotaDecision, QuotaFeature};
use crate::store::{
    CommitOutcome, Reservation, StatusTransition, SubscriptionStore, UsageStore, WebhookClaim,
    WebhookEventRecord, WebhookEventStatus, WebhookEventStore, STALE_PROCESSING_MINUTES,
};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan, status, start_date, end_date, \
     payment_method, stripe_subscription_id, last_event_at";

const TRANSACTION_COLUMNS: &str =
    "id, user_id, kind, amount_cents, category, description, date, recurring";

const GOAL_COLUMNS: &str =
    "id, user_id, name, target_amount_cents, current_amount_cents, target_date, priority";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Serialize quota-checked inserts per user for the rest of `tx`
    async fn lock_user(tx: &mut DbTransaction<'_, Postgres>, user_id: Uuid) -> BillingResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn plan_in_tx(
        tx: &mut DbTransaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<PlanTier> {
        let plan: Option<(PlanTier,)> = sqlx::query_as("SELECT plan FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
        plan.map(|(p,)| p)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, plan, stripe_customer_id, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn update_user(&self, user_id: Uuid, update: &UserUpdate) -> BillingResult<bool> {
        if update.is_empty() {
            return Ok(self.get_user(user_id).await?.is_some());
        }

        let result = sqlx::query(
            r#"
            UPDATE users
            SET name = COALESCE($2, name),
                stripe_customer_id = COALESCE($3, stripe_customer_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(&update.name)
        .bind(&update.stripe_customer_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan, status, start_date, payment_method, stripe_subscription_id
            )
            VALUES ($1, $2, $3, $4, NOW(), $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.plan)
        .bind(new.status)
        .bind(new.payment_method)
        .bind(&new.stripe_subscription_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND status = 'active' LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_latest_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 ORDER BY start_date DESC, created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_by_external_ref(
        &self,
        external_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn update_status(&self, transition: &StatusTransition) -> BillingResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;
        let update = &transition.update;

        // Compare-and-set on status and last applied event time
        let updated = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET status = COALESCE($3, status),
                plan = COALESCE($4, plan),
                end_date = COALESCE($5, end_date),
                last_event_at = COALESCE($6, last_event_at),
                updated_at = NOW()
            WHERE id = $1
              AND status = $2
              AND last_event_at IS NOT DISTINCT FROM $7
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(transition.subscription_id)
        .bind(transition.expected_status)
        .bind(update.status)
        .bind(update.plan)
        .bind(update.end_date)
        .bind(update.last_event_at)
        .bind(transition.expected_last_event_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(subscription) = updated else {
            tx.rollback().await?;
            return Ok(CommitOutcome::Conflict);
        };

        // The user's plan mirrors whichever subscription is Active afterwards
        let plan_write = sqlx::query_as::<_, (PlanTier,)>(
            r#"
            UPDATE users
            SET plan = COALESCE(
                    (SELECT s.plan FROM subscriptions s
                     WHERE s.user_id = $1 AND s.status = 'active'
                     LIMIT 1),
                    'free'
                ),
                updated_at = NOW()
            WHERE id = $1
            RETURNING plan
            "#,
        )
        .bind(transition.user_id)
        .fetch_optional(&mut *tx)
        .await;

        let user_plan = match plan_write_result(subscription.id, transition.user_id, plan_write) {
            Ok(plan) => plan,
            Err(e) => {
                // Rolled back on drop; an explicit rollback on a dead
                // connection would replace this error with its own
                drop(tx);
                return Err(e);
            }
        };

        tx.commit().await?;

        Ok(CommitOutcome::Committed {
            subscription,
            user_plan,
        })
    }

    async fn append_audit_event(&self, event: &NewAuditEvent) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                id,
                user_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id)
        .bind(event.event_type.to_string())
        .bind(&event.event_data)
        .bind(&event.stripe_event_id)
        .bind(&event.stripe_subscription_id)
        .bind(event.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn user_plan(&self, user_id: Uuid) -> BillingResult<Option<PlanTier>> {
        let plan: Option<(PlanTier,)> = sqlx::query_as("SELECT plan FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan.map(|(p,)| p))
    }

    async fn count_transactions_between(
        &self,
        user_id: Uuid,
        first_day: Date,
        last_day: Date,
    ) -> BillingResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transactions WHERE user_id = $1 AND date BETWEEN $2 AND $3",
        )
        .bind(user_id)
        .bind(first_day)
        .bind(last_day)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_goals(&self, user_id: Uuid) -> BillingResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM goals WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_transaction(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
    ) -> BillingResult<Transaction> {
        let mut tx = self.pool.begin().await?;
        let transaction = insert_transaction_in(&mut tx, user_id, new).await?;
        tx.commit().await?;
        Ok(transaction)
    }

    async fn insert_goal(&self, user_id: Uuid, new: &NewGoal) -> BillingResult<Goal> {
        let mut tx = self.pool.begin().await?;
        let goal = insert_goal_in(&mut tx, user_id, new).await?;
        tx.commit().await?;
        Ok(goal)
    }

    async fn insert_transaction_checked(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
        now: OffsetDateTime,
    ) -> BillingResult<Reservation<Transaction>> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, user_id).await?;

        let plan = Self::plan_in_tx(&mut tx, user_id).await?;
        let usage = if quota::limit_for(plan, QuotaFeature::Transactions).is_some() {
            let window = quota::month_window(now);
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM transactions WHERE user_id = $1 AND date BETWEEN $2 AND $3",
            )
            .bind(user_id)
            .bind(window.first_day)
            .bind(window.last_day)
            .fetch_one(&mut *tx)
            .await?;
            count.max(0) as u64
        } else {
            0
        };

        match quota::evaluate(plan, QuotaFeature::Transactions, usage) {
            QuotaDecision::Allowed => {
                let transaction = insert_transaction_in(&mut tx, user_id, new).await?;
                tx.commit().await?;
                Ok(Reservation::Reserved(transaction))
            }
            QuotaDecision::Denied(reason) => {
                tx.rollback().await?;
                Ok(Reservation::Denied(reason))
            }
        }
    }

    async fn insert_goal_checked(
        &self,
        user_id: Uuid,
        new: &NewGoal,
    ) -> BillingResult<Reservation<Goal>> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, user_id).await?;

        let plan = Self::plan_in_tx(&mut tx, user_id).await?;
        let usage = if quota::limit_for(plan, QuotaFeature::Goals).is_some() {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM goals WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;
            count.max(0) as u64
        } else {
            0
        };

        match quota::evaluate(plan, QuotaFeature::Goals, usage) {
            QuotaDecision::Allowed => {
                let goal = insert_goal_in(&mut tx, user_id, new).await?;
                tx.commit().await?;
                Ok(Reservation::Reserved(goal))
            }
            QuotaDecision::Denied(reason) => {
                tx.rollback().await?;
                Ok(Reservation::Denied(reason))
            }
        }
    }

    async fn increment_goal_progress(
        &self,
        user_id: Uuid,
        goal_id: Uuid,
        delta_cents: i64,
    ) -> BillingResult<Option<Goal>> {
        // Single-statement increment; concurrent contributions never overwrite each other
        let goal = sqlx::query_as::<_, Goal>(&format!(
            r#"
            UPDATE goals
            SET current_amount_cents = current_amount_cents + $3
            WHERE id = $1 AND user_id = $2
            RETURNING {GOAL_COLUMNS}
            "#
        ))
        .bind(goal_id)
        .bind(user_id)
        .bind(delta_cents)
        .fetch_optional(&self.pool)
        .await?;

        Ok(goal)
    }
}

async fn insert_transaction_in(
    tx: &mut DbTransaction<'_, Postgres>,
    user_id: Uuid,
    new: &NewTransaction,
) -> BillingResult<Transaction> {
    let transaction = sqlx::query_as::<_, Transaction>(&format!(
        r#"
        INSERT INTO transactions (id, user_id, kind, amount_cents, category, description, date, recurring)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(new.kind)
    .bind(new.amount_cents)
    .bind(&new.category)
    .bind(&new.description)
    .bind(new.date)
    .bind(new.recurring)
    .fetch_one(&mut **tx)
    .await?;

    Ok(transaction)
}

async fn insert_goal_in(
    tx: &mut DbTransaction<'_, Postgres>,
    user_id: Uuid,
    new: &NewGoal,
) -> BillingResult<Goal> {
    let goal = sqlx::query_as::<_, Goal>(&format!(
        r#"
        INSERT INTO goals (id, user_id, name, target_amount_cents, current_amount_cents, target_date, priority)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {GOAL_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(&new.name)
    .bind(new.target_amount_cents)
    .bind(new.current_amount_cents)
    .bind(new.target_date)
    .bind(new.priority)
    .fetch_one(&mut **tx)
    .await?;

    Ok(goal)
}

/// Classify the user plan write that follows a staged subscription write.
/// Any failure here is a partial commit, whatever the underlying cause.
fn plan_write_result(
    subscription_id: Uuid,
    user_id: Uuid,
    plan_write: Result<Option<(PlanTier,)>, sqlx::Error>,
) -> BillingResult<PlanTier> {
    match plan_write {
        Ok(Some((plan,))) => Ok(plan),
        Ok(None) => Err(BillingError::PartialCommit {
            subscription_id,
            reason: format!("user {} not found", user_id),
        }),
        Err(e) => Err(BillingError::PartialCommit {
            subscription_id,
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<WebhookClaim> {
        // Atomic claim: insert fresh, or take back a failed/abandoned delivery
        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events (
                id, stripe_event_id, event_type, payload, status, attempts, last_attempt_at
            )
            VALUES ($1, $2, $3, $4, 'processing', 1, NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE
            SET status = 'processing',
                attempts = billing_webhook_events.attempts + 1,
                payload = EXCLUDED.payload,
                last_attempt_at = NOW()
            WHERE billing_webhook_events.status = 'failed'
               OR (billing_webhook_events.status = 'processing'
                   AND billing_webhook_events.last_attempt_at < NOW() - make_interval(mins => $5))
            RETURNING attempts
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(STALE_PROCESSING_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((attempts,)) = claimed {
            return Ok(WebhookClaim::Claimed { attempts });
        }

        let (status,): (WebhookEventStatus,) =
            sqlx::query_as("SELECT status FROM billing_webhook_events WHERE stripe_event_id = $1")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(WebhookClaim::AlreadyHandled(status))
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let finished = matches!(
            status,
            WebhookEventStatus::Success | WebhookEventStatus::Ignored
        );

        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET status = $2,
                last_error = $3,
                processed_at = CASE WHEN $4 THEN NOW() ELSE processed_at END
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(error)
        .bind(finished)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_dead_letters(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT stripe_event_id, event_type, status, attempts, last_error,
                   last_attempt_at, created_at
            FROM billing_webhook_events
            WHERE status = 'dead_letter'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_stuck_processing(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT stripe_event_id, event_type, status, attempts, last_error,
                   last_attempt_at, created_at
            FROM billing_webhook_events
            WHERE status = 'processing'
              AND last_attempt_at < NOW() - make_interval(mins => $1)
            ORDER BY last_attempt_at ASC
            LIMIT $2
            "#,
        )
        .bind(STALE_PROCESSING_MINUTES)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn purge_webhook_events(&self, days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM billing_webhook_events
            WHERE status IN ('success', 'ignored')
              AND processed_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
