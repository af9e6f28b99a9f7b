//! User-facing billing notifications.
//!
//! Notifications are side effects of committed transitions. Delivery is
//! fire-and-forget: a failure is logged and never rolls back or retries the
//! transition that triggered it.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Sent when a failed payment expires the user's subscription
pub const PAYMENT_FAILED_MESSAGE: &str =
    "Your payment failed and your subscription was canceled. Update your payment method to continue.";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: Uuid, message: &str) -> BillingResult<()>;
}

/// Stores notifications in the `notifications` table for in-app display
#[derive(Clone)]
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn notify(&self, user_id: Uuid, message: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, message, read, created_at)
            VALUES ($1, $2, $3, FALSE, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Deliver a notification, logging instead of failing
pub(crate) async fn notify_best_effort(sink: &dyn NotificationSink, user_id: Uuid, message: &str) {
    if let Err(e) = sink.notify(user_id, message).await {
        tracing::warn!(
            user_id = %user_id,
            error = %e,
            "Failed to enqueue billing notification"
        );
    }
}
