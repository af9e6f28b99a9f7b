//! Stripe webhook handling
//!
//! Deliveries are verified, claimed exactly once by event id, normalized into
//! a [`BillingEvent`] and handed to the reconciler. Failures that may succeed
//! later are recorded and reported back so Stripe redelivers; after
//! `max_attempts` the delivery is parked as a dead letter for review.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use finplan_shared::PlanTier;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Expandable};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::PaymentProcessor;
use crate::reconciler::{
    BillingEvent, BillingEventKind, BillingReconciler, EventMetadata, ReconcileOutcome,
};
use crate::store::{WebhookClaim, WebhookEventStatus, WebhookEventStore};

/// Maximum accepted age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Default number of deliveries before an event is dead-lettered
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

type HmacSha256 = Hmac<Sha256>;

/// Check a `Stripe-Signature` header (`t=...,v1=...[,v1=...]`) against the
/// raw payload.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("HMAC key rejected".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = mac.finalize().into_bytes();

    // Any v1 entry may match; Stripe sends several while secrets roll
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|provided| bool::from(expected.as_slice().ct_eq(&provided)))
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Map a processor event type onto the engine's event kinds
pub fn event_kind(event_type: &EventType) -> Option<BillingEventKind> {
    match event_type {
        EventType::InvoicePaymentSucceeded | EventType::InvoicePaid => {
            Some(BillingEventKind::PaymentSucceeded)
        }
        EventType::InvoicePaymentFailed => Some(BillingEventKind::PaymentFailed),
        EventType::CustomerSubscriptionDeleted => Some(BillingEventKind::SubscriptionCanceled),
        _ => None,
    }
}

/// Read the metadata keys stamped at subscription creation
pub fn parse_metadata(raw: &HashMap<String, String>) -> EventMetadata {
    let user_id = raw.get("user_id").and_then(|v| match v.parse::<Uuid>() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(user_id = %v, "Ignoring malformed user_id in subscription metadata");
            None
        }
    });
    let plan = raw.get("plan").and_then(|v| match v.parse::<PlanTier>() {
        Ok(plan) => Some(plan),
        Err(_) => {
            tracing::warn!(plan = %v, "Ignoring unknown plan in subscription metadata");
            None
        }
    });
    EventMetadata { user_id, plan }
}

/// Raw delivery identity, recorded before processing starts
#[derive(Debug, Clone, Copy)]
pub struct WebhookDelivery<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub payload: &'a str,
}

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    Processed(ReconcileOutcome),
    /// Not an event type the engine acts on
    Ignored,
    /// Already handled by an earlier delivery
    Duplicate(WebhookEventStatus),
    /// Another delivery claimed this event and has not finished it yet
    InFlight,
    /// Failed; Stripe should redeliver
    RetryLater { attempts: i32, error: String },
    /// Failed for the last time; parked for operator review
    DeadLettered { attempts: i32, error: String },
}

impl WebhookDisposition {
    /// Whether the response should ask Stripe to redeliver
    pub fn wants_redelivery(&self) -> bool {
        matches!(
            self,
            WebhookDisposition::RetryLater { .. } | WebhookDisposition::InFlight
        )
    }
}

/// Webhook handler
pub struct WebhookHandler {
    webhook_secret: String,
    events: Arc<dyn WebhookEventStore>,
    processor: Arc<dyn PaymentProcessor>,
    reconciler: Arc<BillingReconciler>,
    max_attempts: i32,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: String,
        events: Arc<dyn WebhookEventStore>,
        processor: Arc<dyn PaymentProcessor>,
        reconciler: Arc<BillingReconciler>,
        max_attempts: i32,
    ) -> Self {
        Self {
            webhook_secret,
            events,
            processor,
            reconciler,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Verify webhook signature and parse event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str::<Event>(payload).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook payload");
            BillingError::WebhookPayload("malformed event payload".to_string())
        })
    }

    /// Handle a verified Stripe event
    pub async fn handle_event(
        &self,
        event: &Event,
        payload: &str,
    ) -> BillingResult<WebhookDisposition> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let delivery = WebhookDelivery {
            event_id: &event_id,
            event_type: &event_type,
            payload,
        };

        self.process(&delivery, self.normalize(event)).await
    }

    /// Claim `delivery`, then run `normalize` and reconcile its result.
    ///
    /// `normalize` is only polled once the claim succeeds, so a failure while
    /// normalizing is recorded against the delivery like any other.
    pub async fn process<F>(
        &self,
        delivery: &WebhookDelivery<'_>,
        normalize: F,
    ) -> BillingResult<WebhookDisposition>
    where
        F: Future<Output = BillingResult<Option<BillingEvent>>> + Send,
    {
        let attempts = match self
            .events
            .claim_webhook_event(delivery.event_id, delivery.event_type, delivery.payload)
            .await?
        {
            WebhookClaim::Claimed { attempts } => attempts,
            // Unfinished; acking now would drop the event if that delivery died
            WebhookClaim::AlreadyHandled(WebhookEventStatus::Processing) => {
                tracing::warn!(
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    "Webhook event is still processing, asking for redelivery"
                );
                return Ok(WebhookDisposition::InFlight);
            }
            WebhookClaim::AlreadyHandled(status) => {
                tracing::info!(
                    event_id = %delivery.event_id,
                    status = %status,
                    "Webhook event already handled, skipping"
                );
                return Ok(WebhookDisposition::Duplicate(status));
            }
        };

        let result = match normalize.await {
            Ok(Some(billing_event)) => self.reconciler.reconcile(&billing_event).await.map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        match result {
            Ok(None) => {
                self.events
                    .finish_webhook_event(delivery.event_id, WebhookEventStatus::Ignored, None)
                    .await?;
                tracing::debug!(
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    "Ignoring webhook event"
                );
                Ok(WebhookDisposition::Ignored)
            }
            Ok(Some(outcome)) => {
                self.events
                    .finish_webhook_event(delivery.event_id, WebhookEventStatus::Success, None)
                    .await?;
                tracing::info!(
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    outcome = ?outcome,
                    "Webhook event processed"
                );
                Ok(WebhookDisposition::Processed(outcome))
            }
            Err(e) if e.is_retryable() && attempts < self.max_attempts => {
                let error = e.to_string();
                self.events
                    .finish_webhook_event(
                        delivery.event_id,
                        WebhookEventStatus::Failed,
                        Some(&error),
                    )
                    .await?;
                tracing::warn!(
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    attempts = attempts,
                    error = %error,
                    "Webhook event failed, awaiting redelivery"
                );
                Ok(WebhookDisposition::RetryLater { attempts, error })
            }
            Err(e) => {
                let error = e.to_string();
                self.events
                    .finish_webhook_event(
                        delivery.event_id,
                        WebhookEventStatus::DeadLetter,
                        Some(&error),
                    )
                    .await?;
                tracing::error!(
                    event_id = %delivery.event_id,
                    event_type = %delivery.event_type,
                    attempts = attempts,
                    error = %error,
                    "Webhook event moved to dead letter"
                );
                Ok(WebhookDisposition::DeadLettered { attempts, error })
            }
        }
    }

    /// Turn a Stripe event into a [`BillingEvent`], or `None` when the engine
    /// does not act on it.
    pub async fn normalize(&self, event: &Event) -> BillingResult<Option<BillingEvent>> {
        let Some(kind) = event_kind(&event.type_) else {
            return Ok(None);
        };

        let (external_ref, raw_metadata) = match &event.data.object {
            EventObject::Invoice(invoice) => match &invoice.subscription {
                Some(Expandable::Object(sub)) => (sub.id.to_string(), Some(sub.metadata.clone())),
                Some(Expandable::Id(id)) => (id.to_string(), None),
                // One-off invoice, not tied to a subscription
                None => return Ok(None),
            },
            EventObject::Subscription(sub) => (sub.id.to_string(), Some(sub.metadata.clone())),
            _ => {
                return Err(BillingError::WebhookPayload(format!(
                    "unexpected object for {}",
                    event.type_
                )))
            }
        };

        let raw_metadata = match raw_metadata {
            Some(metadata) => metadata,
            None => self.processor.subscription_metadata(&external_ref).await?,
        };

        let mut billing_event = BillingEvent::new(kind, external_ref)
            .with_metadata(parse_metadata(&raw_metadata))
            .source_event(event.id.to_string());
        if let Ok(created) = OffsetDateTime::from_unix_timestamp(event.created) {
            billing_event = billing_event.occurred_at(created);
        }

        Ok(Some(billing_event))
    }
}
