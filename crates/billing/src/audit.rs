//! Billing Audit Log
//!
//! Append-only record of every applied subscription transition, so that
//! "why is this user on this plan?" can be answered after the fact.
//!
//! Audit writes happen after the transition has committed. A failed audit
//! write is logged and otherwise ignored; it never undoes or fails the
//! transition it describes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::SubscriptionStore;

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionExpired,
    SubscriptionCanceled,
    CustomerCreated,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            AuditEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            AuditEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            AuditEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            AuditEventType::CustomerCreated => "CUSTOMER_CREATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the API
    User,
    /// Background job
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// An audit row ready to be appended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAuditEvent {
    pub user_id: Uuid,
    pub event_type: AuditEventType,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_type: ActorType,
}

/// Builder for audit events
pub struct AuditEventBuilder {
    event: NewAuditEvent,
}

impl AuditEventBuilder {
    pub fn new(user_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            event: NewAuditEvent {
                user_id,
                event_type,
                event_data: serde_json::json!({}),
                stripe_event_id: None,
                stripe_subscription_id: None,
                actor_type: ActorType::System,
            },
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event.event_data = data;
        self
    }

    /// Set the Stripe event ID
    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.event.stripe_event_id = Some(event_id.into());
        self
    }

    /// Set the Stripe subscription ID
    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.event.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.event.actor_type = actor_type;
        self
    }

    pub fn build(self) -> NewAuditEvent {
        self.event
    }
}

/// Writes audit events through the subscription store
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn SubscriptionStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: AuditEventBuilder) -> BillingResult<Uuid> {
        self.store.append_audit_event(&builder.build()).await
    }

    /// Log without surfacing failures to the caller
    pub async fn log_best_effort(&self, builder: AuditEventBuilder) {
        let event = builder.build();
        if let Err(e) = self.store.append_audit_event(&event).await {
            tracing::warn!(
                user_id = %event.user_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to write billing audit event"
            );
        }
    }
}
