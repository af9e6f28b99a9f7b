//! Subscription management: summary, creation and user-initiated cancellation.
//!
//! Creation only records a Pending subscription; it becomes Active when the
//! processor reports the first successful payment. Cancellation goes through
//! the reconciler so it commits atomically with the user's plan.

use std::collections::HashMap;
use std::sync::Arc;

use finplan_shared::{
    NewSubscription, PaymentMethod, PlanTier, Subscription, SubscriptionStatus, User, UserUpdate,
};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::processor::PaymentProcessor;
use crate::reconciler::{
    BillingEvent, BillingEventKind, BillingReconciler, EventMetadata, ReconcileOutcome,
};
use crate::store::SubscriptionStore;

/// What GET /subscription reports. Users without any subscription see only
/// the Free plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSummary {
    pub plan: PlanTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub start_date: Option<OffsetDateTime>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub end_date: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
}

impl SubscriptionSummary {
    pub fn free() -> Self {
        Self {
            plan: PlanTier::Free,
            status: None,
            start_date: None,
            end_date: None,
            payment_method: None,
        }
    }
}

impl From<&Subscription> for SubscriptionSummary {
    fn from(sub: &Subscription) -> Self {
        Self {
            plan: sub.plan,
            status: Some(sub.status),
            start_date: Some(sub.start_date),
            end_date: sub.end_date,
            payment_method: Some(sub.payment_method),
        }
    }
}

/// Returned to the client to finish payment confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutConfirmation {
    pub subscription_id: Uuid,
    pub stripe_subscription_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    processor: Arc<dyn PaymentProcessor>,
    reconciler: Arc<BillingReconciler>,
    audit: AuditLogger,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        processor: Arc<dyn PaymentProcessor>,
        reconciler: Arc<BillingReconciler>,
    ) -> Self {
        Self {
            audit: AuditLogger::new(store.clone()),
            store,
            processor,
            reconciler,
        }
    }

    /// Latest subscription of the user, or the Free summary when none exists
    pub async fn get_summary(&self, user_id: Uuid) -> BillingResult<SubscriptionSummary> {
        Ok(self
            .store
            .find_latest_by_user(user_id)
            .await?
            .as_ref()
            .map(SubscriptionSummary::from)
            .unwrap_or_else(SubscriptionSummary::free))
    }

    /// Start a paid subscription.
    pub async fn create(
        &self,
        user_id: Uuid,
        plan: &str,
        payment_method: &str,
    ) -> BillingResult<CheckoutConfirmation> {
        let plan = PlanTier::parse_paid(plan)?;
        let payment_method: PaymentMethod = payment_method.parse()?;

        if self.store.find_active_by_user(user_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed);
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        let customer_id = self.ensure_customer(&user).await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan".to_string(), plan.to_string());
        metadata.insert("payment_method".to_string(), payment_method.to_string());

        let processor_sub = self
            .processor
            .create_subscription(&customer_id, plan, metadata)
            .await?;

        let subscription = self
            .store
            .create_subscription(&NewSubscription {
                user_id,
                plan,
                status: SubscriptionStatus::Pending,
                payment_method,
                stripe_subscription_id: processor_sub.external_ref.clone(),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            stripe_subscription_id = %subscription.stripe_subscription_id,
            plan = %plan,
            payment_method = %payment_method,
            "Created pending subscription"
        );

        self.audit
            .log_best_effort(
                AuditEventBuilder::new(user_id, AuditEventType::SubscriptionCreated)
                    .stripe_subscription(&subscription.stripe_subscription_id)
                    .actor_type(ActorType::User)
                    .data(serde_json::json!({
                        "plan": plan,
                        "payment_method": payment_method,
                    })),
            )
            .await;

        Ok(CheckoutConfirmation {
            subscription_id: subscription.id,
            stripe_subscription_id: processor_sub.external_ref,
            client_secret: processor_sub.client_secret,
            payment_intent_id: processor_sub.payment_intent_id,
        })
    }

    /// Cancel the user's Active subscription at the processor, then record it.
    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<SubscriptionSummary> {
        let active = self
            .store
            .find_active_by_user(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription)?;

        self.processor
            .cancel_subscription(&active.stripe_subscription_id)
            .await?;

        let event = BillingEvent::new(
            BillingEventKind::SubscriptionCanceled,
            &active.stripe_subscription_id,
        )
        .with_metadata(EventMetadata {
            user_id: Some(user_id),
            plan: None,
        });

        match self.reconciler.reconcile(&event).await? {
            ReconcileOutcome::Applied { .. } => {}
            other => {
                // The processor already canceled; its webhook will retry the record
                tracing::warn!(
                    user_id = %user_id,
                    subscription_id = %active.id,
                    outcome = ?other,
                    "Cancellation was not applied locally"
                );
            }
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %active.id,
            "Subscription canceled by user"
        );

        match self.store.find_by_external_ref(&active.stripe_subscription_id).await? {
            Some(sub) => Ok(SubscriptionSummary::from(&sub)),
            None => Ok(SubscriptionSummary::free()),
        }
    }

    /// Processor customer for `user`, created and stored on first use
    async fn ensure_customer(&self, user: &User) -> BillingResult<String> {
        if let Some(customer_id) = &user.stripe_customer_id {
            return Ok(customer_id.clone());
        }

        let customer_id = self.processor.create_customer(user).await?;
        let updated = self
            .store
            .update_user(
                user.id,
                &UserUpdate {
                    stripe_customer_id: Some(customer_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        if !updated {
            return Err(BillingError::NotFound(format!("user {}", user.id)));
        }

        self.audit
            .log_best_effort(
                AuditEventBuilder::new(user.id, AuditEventType::CustomerCreated)
                    .actor_type(ActorType::User)
                    .data(serde_json::json!({ "customer_id": customer_id })),
            )
            .await;

        Ok(customer_id)
    }
}
