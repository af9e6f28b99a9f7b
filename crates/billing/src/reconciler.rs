//! Billing Event Reconciler
//!
//! Maps processor events onto the subscription lifecycle:
//!
//! ```text
//!             PaymentSucceeded                 PaymentFailed
//!   Pending ------------------> Active -------------------------> Expired
//!      |                        |  ^ PaymentSucceeded (renewal)
//!      |                        |__|
//!      |   SubscriptionCanceled |
//!      +------------------------+-------------------------------> Canceled
//! ```
//!
//! Canceled and Expired are terminal. Every applied transition rewrites the
//! subscription and the owner's plan in a single store transaction; side
//! effects (notification, audit row) run only after that commits.
//!
//! Redelivery is safe: re-applying the same event converges to the same
//! state, events older than the last applied one are dropped, and events that
//! would resurrect a terminal subscription are rejected.

use std::sync::Arc;
use std::time::Duration;

use finplan_shared::{PlanTier, Subscription, SubscriptionStatus, SubscriptionUpdate};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::notifications::{notify_best_effort, NotificationSink, PAYMENT_FAILED_MESSAGE};
use crate::store::{CommitOutcome, StatusTransition, SubscriptionStore};

/// Length of one paid period granted by a successful payment
pub const BILLING_PERIOD: time::Duration = time::Duration::days(30);

/// Default number of commit attempts per event
pub const DEFAULT_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCanceled,
}

impl std::fmt::Display for BillingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingEventKind::PaymentSucceeded => write!(f, "payment_succeeded"),
            BillingEventKind::PaymentFailed => write!(f, "payment_failed"),
            BillingEventKind::SubscriptionCanceled => write!(f, "subscription_canceled"),
        }
    }
}

/// Metadata the engine stamps on processor subscriptions at creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventMetadata {
    pub user_id: Option<Uuid>,
    pub plan: Option<PlanTier>,
}

/// A normalized processor event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingEvent {
    pub kind: BillingEventKind,
    pub external_ref: String,
    pub metadata: EventMetadata,
    /// Processor-side creation time, when known
    pub occurred_at: Option<OffsetDateTime>,
    /// Processor event id, for the audit trail
    pub source_event_id: Option<String>,
}

impl BillingEvent {
    pub fn new(kind: BillingEventKind, external_ref: impl Into<String>) -> Self {
        Self {
            kind,
            external_ref: external_ref.into(),
            metadata: EventMetadata::default(),
            occurred_at: None,
            source_event_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn occurred_at(mut self, at: OffsetDateTime) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn source_event(mut self, event_id: impl Into<String>) -> Self {
        self.source_event_id = Some(event_id.into());
        self
    }
}

/// Why an event was recorded but not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No subscription with this external reference exists
    UnknownSubscription,
    /// Event metadata names a different user than the stored record
    UserMismatch,
    /// Event metadata carries a plan the engine does not sell
    InvalidPlan,
    /// Activating would give the user a second Active subscription
    ConflictingActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        subscription_id: Uuid,
        previous_status: SubscriptionStatus,
        status: SubscriptionStatus,
        user_plan: PlanTier,
    },
    /// Subscription is terminal and the event would have moved it
    Rejected {
        subscription_id: Uuid,
        status: SubscriptionStatus,
    },
    /// Older than the last event applied to the record
    Stale { subscription_id: Uuid },
    Dropped { reason: DropReason },
}

/// Pure transition rule: the update to apply to `current` for `kind`, or
/// `None` when a payment success arrives for a canceled or expired record.
///
/// Failure and cancellation apply from any status. A paid period starts at
/// `effective_at`, the event time when the processor supplied one, so
/// applying the same event twice yields the same end date.
pub fn decide_transition(
    current: &Subscription,
    kind: BillingEventKind,
    plan: PlanTier,
    effective_at: OffsetDateTime,
) -> Option<SubscriptionUpdate> {
    match (current.status, kind) {
        // A terminated subscription is never resurrected
        (status, BillingEventKind::PaymentSucceeded) if status.is_terminal() => None,
        (_, BillingEventKind::PaymentSucceeded) => Some(SubscriptionUpdate {
            plan: Some(plan),
            status: Some(SubscriptionStatus::Active),
            end_date: Some(effective_at + BILLING_PERIOD),
            ..Default::default()
        }),
        // Redelivery to a record already in the target state is a no-op apply
        (SubscriptionStatus::Expired, BillingEventKind::PaymentFailed)
        | (SubscriptionStatus::Canceled, BillingEventKind::SubscriptionCanceled) => {
            Some(SubscriptionUpdate::default())
        }
        (_, BillingEventKind::PaymentFailed) => Some(SubscriptionUpdate {
            status: Some(SubscriptionStatus::Expired),
            ..Default::default()
        }),
        (_, BillingEventKind::SubscriptionCanceled) => Some(SubscriptionUpdate {
            status: Some(SubscriptionStatus::Canceled),
            ..Default::default()
        }),
    }
}

/// Applies normalized billing events to stored state
pub struct BillingReconciler {
    store: Arc<dyn SubscriptionStore>,
    notifier: Arc<dyn NotificationSink>,
    audit: AuditLogger,
    commit_attempts: usize,
}

impl BillingReconciler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        notifier: Arc<dyn NotificationSink>,
        commit_attempts: usize,
    ) -> Self {
        Self {
            audit: AuditLogger::new(store.clone()),
            store,
            notifier,
            commit_attempts: commit_attempts.max(1),
        }
    }

    /// Apply `event`, retrying the read-decide-commit cycle on transient
    /// failures. A [`BillingError::PartialCommit`] is not retried here; it
    /// surfaces so the delivery is retried as a whole.
    pub async fn reconcile(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(500))
            .map(jitter)
            .take(self.commit_attempts.saturating_sub(1));

        let result = RetryIf::spawn(
            strategy,
            || self.attempt(event),
            |e: &BillingError| {
                let retry = e.is_transient();
                if retry {
                    tracing::debug!(
                        external_ref = %event.external_ref,
                        error = %e,
                        "Retrying billing event commit"
                    );
                }
                retry
            },
        )
        .await;

        if let Err(BillingError::PartialCommit {
            subscription_id,
            reason,
        }) = &result
        {
            tracing::error!(
                subscription_id = %subscription_id,
                external_ref = %event.external_ref,
                event_kind = %event.kind,
                reason = %reason,
                "CRITICAL: subscription and plan write did not commit together; rolled back"
            );
        }

        result
    }

    async fn attempt(&self, event: &BillingEvent) -> BillingResult<ReconcileOutcome> {
        let Some(current) = self.store.find_by_external_ref(&event.external_ref).await? else {
            tracing::warn!(
                external_ref = %event.external_ref,
                event_kind = %event.kind,
                "Billing event for unknown subscription"
            );
            return Ok(ReconcileOutcome::Dropped {
                reason: DropReason::UnknownSubscription,
            });
        };

        if let Some(user_id) = event.metadata.user_id {
            if user_id != current.user_id {
                tracing::warn!(
                    subscription_id = %current.id,
                    stored_user_id = %current.user_id,
                    event_user_id = %user_id,
                    "Billing event metadata names a different user"
                );
                return Ok(ReconcileOutcome::Dropped {
                    reason: DropReason::UserMismatch,
                });
            }
        }

        if let (Some(occurred_at), Some(last_event_at)) = (event.occurred_at, current.last_event_at)
        {
            if occurred_at < last_event_at {
                tracing::info!(
                    subscription_id = %current.id,
                    occurred_at = %occurred_at,
                    last_event_at = %last_event_at,
                    "Dropping out-of-order billing event"
                );
                return Ok(ReconcileOutcome::Stale {
                    subscription_id: current.id,
                });
            }
        }

        let plan = match event.metadata.plan {
            Some(plan) if plan.is_paid() => plan,
            Some(plan) => {
                tracing::warn!(
                    subscription_id = %current.id,
                    plan = %plan,
                    "Billing event metadata carries an unpaid plan"
                );
                return Ok(ReconcileOutcome::Dropped {
                    reason: DropReason::InvalidPlan,
                });
            }
            None => current.plan,
        };

        let effective_at = event.occurred_at.unwrap_or_else(OffsetDateTime::now_utc);
        let Some(mut update) = decide_transition(&current, event.kind, plan, effective_at) else {
            tracing::warn!(
                subscription_id = %current.id,
                status = %current.status,
                event_kind = %event.kind,
                "Rejected payment success for terminal subscription"
            );
            return Ok(ReconcileOutcome::Rejected {
                subscription_id: current.id,
                status: current.status,
            });
        };
        update.last_event_at = event.occurred_at;

        let transition = StatusTransition {
            subscription_id: current.id,
            user_id: current.user_id,
            expected_status: current.status,
            expected_last_event_at: current.last_event_at,
            update,
        };

        let (subscription, user_plan) = match self.store.update_status(&transition).await {
            Ok(CommitOutcome::Committed {
                subscription,
                user_plan,
            }) => (subscription, user_plan),
            Ok(CommitOutcome::Conflict) => {
                return Err(BillingError::ConcurrentModification(format!(
                    "subscription {} changed while applying {}",
                    current.id, event.kind
                )));
            }
            Err(BillingError::AlreadySubscribed) => {
                tracing::warn!(
                    subscription_id = %current.id,
                    user_id = %current.user_id,
                    "Payment succeeded for a subscription while another one is active"
                );
                return Ok(ReconcileOutcome::Dropped {
                    reason: DropReason::ConflictingActive,
                });
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            previous_status = %current.status,
            status = %subscription.status,
            user_plan = %user_plan,
            "Applied billing event"
        );

        self.after_commit(event, &current, &subscription, user_plan)
            .await;

        Ok(ReconcileOutcome::Applied {
            subscription_id: subscription.id,
            previous_status: current.status,
            status: subscription.status,
            user_plan,
        })
    }

    async fn after_commit(
        &self,
        event: &BillingEvent,
        previous: &Subscription,
        subscription: &Subscription,
        user_plan: PlanTier,
    ) {
        let moved = previous.status != subscription.status;

        if moved
            && event.kind == BillingEventKind::PaymentFailed
            && subscription.status == SubscriptionStatus::Expired
        {
            notify_best_effort(
                self.notifier.as_ref(),
                subscription.user_id,
                PAYMENT_FAILED_MESSAGE,
            )
            .await;
        }

        let event_type = match (event.kind, previous.status) {
            (BillingEventKind::PaymentSucceeded, SubscriptionStatus::Active) => {
                AuditEventType::SubscriptionRenewed
            }
            (BillingEventKind::PaymentSucceeded, _) => AuditEventType::SubscriptionActivated,
            (BillingEventKind::PaymentFailed, _) => AuditEventType::SubscriptionExpired,
            (BillingEventKind::SubscriptionCanceled, _) => AuditEventType::SubscriptionCanceled,
        };

        let mut builder = AuditEventBuilder::new(subscription.user_id, event_type)
            .stripe_subscription(&subscription.stripe_subscription_id)
            .actor_type(if event.source_event_id.is_some() {
                ActorType::Stripe
            } else {
                ActorType::User
            })
            .data(serde_json::json!({
                "event_kind": event.kind,
                "previous_status": previous.status,
                "status": subscription.status,
                "plan": subscription.plan,
                "user_plan": user_plan,
                "end_date": subscription.end_date.map(|d| d.unix_timestamp()),
            }));
        if let Some(event_id) = &event.source_event_id {
            builder = builder.stripe_event(event_id);
        }
        self.audit.log_best_effort(builder).await;
    }
}
