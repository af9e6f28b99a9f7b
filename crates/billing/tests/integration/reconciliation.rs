//! Subscription lifecycle and webhook delivery scenarios against the
//! in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::future::Ready;
use std::sync::Arc;

use finplan_billing::memory::{FakeProcessor, InMemoryStore, RecordingNotifier};
use finplan_billing::{
    BillingError, BillingEvent, BillingEventKind, BillingResult, BillingService, BillingSettings,
    DropReason, EventMetadata, ReconcileOutcome, WebhookDelivery, WebhookDisposition,
    WebhookEventStatus, WebhookEventStore, PAYMENT_FAILED_MESSAGE,
};
use finplan_shared::{PaymentMethod, PlanTier, Subscription, SubscriptionStatus, User};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

struct Harness {
    store: InMemoryStore,
    processor: Arc<FakeProcessor>,
    notifier: Arc<RecordingNotifier>,
    billing: BillingService,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(BillingSettings::default())
    }

    fn with_settings(settings: BillingSettings) -> Self {
        let store = InMemoryStore::new();
        let processor = Arc::new(FakeProcessor::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let billing = BillingService::with_store(
            Arc::new(store.clone()),
            processor.clone(),
            notifier.clone(),
            "whsec_test".to_string(),
            settings,
        );
        Self {
            store,
            processor,
            notifier,
            billing,
        }
    }

    /// A Free user with a Pending subscription for `plan`
    async fn pending(&self, plan: &str) -> (User, Subscription) {
        let user = self.store.seed_user("maria@example.com", PlanTier::Free);
        let checkout = self
            .billing
            .subscriptions
            .create(user.id, plan, "credit_card")
            .await
            .unwrap();
        let sub = self
            .store
            .subscriptions()
            .into_iter()
            .find(|s| s.id == checkout.subscription_id)
            .unwrap();
        (user, sub)
    }

    fn subscription(&self, id: Uuid) -> Subscription {
        self.store
            .subscriptions()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap()
    }

    fn plan_of(&self, user_id: Uuid) -> PlanTier {
        self.store.user(user_id).unwrap().plan
    }
}

fn event(kind: BillingEventKind, sub: &Subscription, at: OffsetDateTime) -> BillingEvent {
    BillingEvent::new(kind, &sub.stripe_subscription_id)
        .with_metadata(EventMetadata {
            user_id: Some(sub.user_id),
            plan: Some(sub.plan),
        })
        .occurred_at(at)
        .source_event(format!("evt_{}", Uuid::new_v4().simple()))
}

#[tokio::test]
async fn test_payment_succeeded_activates_pending() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let at = OffsetDateTime::now_utc();

    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &sub, at))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            subscription_id: sub.id,
            previous_status: SubscriptionStatus::Pending,
            status: SubscriptionStatus::Active,
            user_plan: PlanTier::Pro,
        }
    );
    let stored = h.subscription(sub.id);
    assert_eq!(stored.status, SubscriptionStatus::Active);
    assert_eq!(stored.end_date, Some(at + Duration::days(30)));
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_payment_succeeded_is_idempotent() {
    let h = Harness::new();
    let (user, sub) = h.pending("business").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    h.billing.reconciler.reconcile(&paid).await.unwrap();
    let once = (h.subscription(sub.id), h.plan_of(user.id));

    h.billing.reconciler.reconcile(&paid).await.unwrap();
    let twice = (h.subscription(sub.id), h.plan_of(user.id));

    assert_eq!(once, twice);
    assert_eq!(twice.1, PlanTier::Business);
}

#[tokio::test]
async fn test_payment_failed_expires_and_notifies_once() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();
    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &sub, t0))
        .await
        .unwrap();

    let failed = event(
        BillingEventKind::PaymentFailed,
        &sub,
        t0 + Duration::seconds(5),
    );
    h.billing.reconciler.reconcile(&failed).await.unwrap();
    // Redelivery of the same failure must not notify again
    h.billing.reconciler.reconcile(&failed).await.unwrap();

    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Expired);
    assert_eq!(h.plan_of(user.id), PlanTier::Free);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], (user.id, PAYMENT_FAILED_MESSAGE.to_string()));
}

#[tokio::test]
async fn test_terminal_subscription_cannot_be_reactivated() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();
    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::SubscriptionCanceled, &sub, t0))
        .await
        .unwrap();

    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            t0 + Duration::seconds(1),
        ))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Rejected {
            subscription_id: sub.id,
            status: SubscriptionStatus::Canceled,
        }
    );
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Canceled);
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
}

#[tokio::test]
async fn test_payment_failed_after_cancellation_expires_and_notifies() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();
    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &sub, t0))
        .await
        .unwrap();
    h.billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::SubscriptionCanceled,
            &sub,
            t0 + Duration::seconds(1),
        ))
        .await
        .unwrap();
    assert!(h.notifier.sent().is_empty());

    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentFailed,
            &sub,
            t0 + Duration::seconds(2),
        ))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            subscription_id: sub.id,
            previous_status: SubscriptionStatus::Canceled,
            status: SubscriptionStatus::Expired,
            user_plan: PlanTier::Free,
        }
    );
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Expired);
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
    assert_eq!(
        h.notifier.sent(),
        vec![(user.id, PAYMENT_FAILED_MESSAGE.to_string())]
    );
}

#[tokio::test]
async fn test_cancellation_after_expiry_cancels() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();
    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentFailed, &sub, t0))
        .await
        .unwrap();
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Expired);

    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::SubscriptionCanceled,
            &sub,
            t0 + Duration::seconds(1),
        ))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Applied {
            subscription_id: sub.id,
            previous_status: SubscriptionStatus::Expired,
            status: SubscriptionStatus::Canceled,
            user_plan: PlanTier::Free,
        }
    );
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Canceled);
    // Only the original failure notified
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_out_of_order_event_is_stale() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();

    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &sub, t0))
        .await
        .unwrap();
    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentFailed,
            &sub,
            t0 - Duration::minutes(10),
        ))
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Stale { subscription_id: sub.id });
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_unknown_subscription_dropped() {
    let h = Harness::new();
    let outcome = h
        .billing
        .reconciler
        .reconcile(&BillingEvent::new(
            BillingEventKind::PaymentSucceeded,
            "sub_does_not_exist",
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Dropped {
            reason: DropReason::UnknownSubscription
        }
    );
}

#[tokio::test]
async fn test_metadata_user_mismatch_dropped() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let forged = BillingEvent::new(BillingEventKind::PaymentSucceeded, &sub.stripe_subscription_id)
        .with_metadata(EventMetadata {
            user_id: Some(Uuid::new_v4()),
            plan: Some(PlanTier::Business),
        });

    let outcome = h.billing.reconciler.reconcile(&forged).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Dropped {
            reason: DropReason::UserMismatch
        }
    );
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
}

#[tokio::test]
async fn test_second_activation_dropped_as_conflict() {
    let h = Harness::new();
    let (user, first) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();
    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &first, t0))
        .await
        .unwrap();

    // A stray pending record for the same user, paid later
    let stray = Subscription {
        id: Uuid::new_v4(),
        stripe_subscription_id: "sub_stray".into(),
        status: SubscriptionStatus::Pending,
        plan: PlanTier::Business,
        end_date: None,
        last_event_at: None,
        ..first.clone()
    };
    h.store.seed_subscription(stray.clone());

    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &stray, t0))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Dropped {
            reason: DropReason::ConflictingActive
        }
    );
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_partial_commit_rolls_back_then_succeeds_on_redelivery() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    h.store.fail_next_plan_writes(1);
    let err = h.billing.reconciler.reconcile(&paid).await.unwrap_err();
    assert!(matches!(err, BillingError::PartialCommit { .. }));
    assert!(err.is_retryable());

    // Nothing from the failed attempt is visible
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Pending);
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
    assert!(h.notifier.sent().is_empty());

    h.billing.reconciler.reconcile(&paid).await.unwrap();
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Active);
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_transient_commit_failure_retried_in_place() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;

    h.store.fail_next_commits(2);
    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_transient_failures_beyond_budget_surface() {
    let h = Harness::new();
    let (_, sub) = h.pending("pro").await;

    h.store.fail_next_commits(3);
    let err = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_notification_failure_does_not_undo_transition() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let t0 = OffsetDateTime::now_utc();
    h.billing
        .reconciler
        .reconcile(&event(BillingEventKind::PaymentSucceeded, &sub, t0))
        .await
        .unwrap();

    h.notifier.fail_deliveries();
    let outcome = h
        .billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentFailed,
            &sub,
            t0 + Duration::seconds(1),
        ))
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
}

#[tokio::test]
async fn test_transitions_are_audited() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    h.billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    let types: Vec<String> = h
        .store
        .audit_events()
        .into_iter()
        .filter(|e| e.user_id == user.id)
        .map(|e| e.event_type.to_string())
        .collect();
    assert!(types.contains(&"SUBSCRIPTION_CREATED".to_string()));
    assert!(types.contains(&"SUBSCRIPTION_ACTIVATED".to_string()));
}

// ---------------------------------------------------------------------------
// Subscription service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_records_pending_and_metadata() {
    let h = Harness::new();
    let user = h.store.seed_user("joao@example.com", PlanTier::Free);

    let checkout = h
        .billing
        .subscriptions
        .create(user.id, "Business", "pix")
        .await
        .unwrap();

    assert!(!checkout.client_secret.is_empty());
    let sub = h.subscription(checkout.subscription_id);
    assert_eq!(sub.status, SubscriptionStatus::Pending);
    assert_eq!(sub.plan, PlanTier::Business);
    assert_eq!(sub.payment_method, PaymentMethod::Pix);
    // Pending does not grant the plan
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
    assert_eq!(
        h.store.user(user.id).unwrap().stripe_customer_id.as_deref(),
        Some("cus_fake_1")
    );
}

#[tokio::test]
async fn test_create_rejects_invalid_input() {
    let h = Harness::new();
    let user = h.store.seed_user("joao@example.com", PlanTier::Free);

    let err = h
        .billing
        .subscriptions
        .create(user.id, "free", "pix")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));

    let err = h
        .billing
        .subscriptions
        .create(user.id, "gold", "pix")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTier(_)));

    let err = h
        .billing
        .subscriptions
        .create(user.id, "pro", "cash")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidInput(_)));
}

#[tokio::test]
async fn test_create_rejects_when_already_active() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    h.billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    let err = h
        .billing
        .subscriptions
        .create(user.id, "business", "credit_card")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AlreadySubscribed));
}

#[tokio::test]
async fn test_cancel_without_active_subscription() {
    let h = Harness::new();
    let user = h.store.seed_user("ana@example.com", PlanTier::Free);

    let err = h.billing.subscriptions.cancel(user.id).await.unwrap_err();
    assert!(matches!(err, BillingError::NoActiveSubscription));
    assert_eq!(err.to_string(), "No active subscription found");
}

#[tokio::test]
async fn test_cancel_active_subscription() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    h.billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    let summary = h.billing.subscriptions.cancel(user.id).await.unwrap();
    assert_eq!(summary.status, Some(SubscriptionStatus::Canceled));
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
    assert_eq!(h.processor.canceled(), vec![sub.stripe_subscription_id.clone()]);

    // Second cancel finds nothing active
    let err = h.billing.subscriptions.cancel(user.id).await.unwrap_err();
    assert!(matches!(err, BillingError::NoActiveSubscription));
}

#[tokio::test]
async fn test_cancel_processor_failure_leaves_state_untouched() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    h.billing
        .reconciler
        .reconcile(&event(
            BillingEventKind::PaymentSucceeded,
            &sub,
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    h.processor.fail_cancellations();
    let err = h.billing.subscriptions.cancel(user.id).await.unwrap_err();
    assert!(matches!(err, BillingError::StripeApi(_)));
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Active);
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_summary_defaults_to_free() {
    let h = Harness::new();
    let user = h.store.seed_user("ana@example.com", PlanTier::Free);

    let summary = h.billing.subscriptions.get_summary(user.id).await.unwrap();
    assert_eq!(summary.plan, PlanTier::Free);
    assert!(summary.status.is_none());
    assert_eq!(
        serde_json::to_value(&summary).unwrap(),
        serde_json::json!({ "plan": "free" })
    );
}

// ---------------------------------------------------------------------------
// Webhook delivery bookkeeping
// ---------------------------------------------------------------------------

fn normalized(event: Option<BillingEvent>) -> Ready<BillingResult<Option<BillingEvent>>> {
    std::future::ready(Ok(event))
}

fn delivery(event_id: &str) -> WebhookDelivery<'_> {
    WebhookDelivery {
        event_id,
        event_type: "invoice.payment_succeeded",
        payload: "{}",
    }
}

#[tokio::test]
async fn test_duplicate_delivery_is_skipped() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    let first = h
        .billing
        .webhooks
        .process(&delivery("evt_dup"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert!(matches!(first, WebhookDisposition::Processed(_)));

    let second = h
        .billing
        .webhooks
        .process(&delivery("evt_dup"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert_eq!(
        second,
        WebhookDisposition::Duplicate(WebhookEventStatus::Success)
    );
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);
}

#[tokio::test]
async fn test_unhandled_event_is_ignored() {
    let h = Harness::new();
    let disposition = h
        .billing
        .webhooks
        .process(&delivery("evt_other"), normalized(None))
        .await
        .unwrap();
    assert_eq!(disposition, WebhookDisposition::Ignored);
    assert_eq!(
        h.store.webhook_event("evt_other").unwrap().status,
        WebhookEventStatus::Ignored
    );
}

#[tokio::test]
async fn test_failed_delivery_retried_then_dead_lettered() {
    let h = Harness::with_settings(BillingSettings {
        webhook_max_attempts: 2,
        ..BillingSettings::default()
    });
    let (user, sub) = h.pending("pro").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    h.store.fail_next_plan_writes(2);
    let first = h
        .billing
        .webhooks
        .process(&delivery("evt_flaky"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert!(first.wants_redelivery());
    assert_eq!(
        h.store.webhook_event("evt_flaky").unwrap().status,
        WebhookEventStatus::Failed
    );

    let second = h
        .billing
        .webhooks
        .process(&delivery("evt_flaky"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert!(matches!(
        second,
        WebhookDisposition::DeadLettered { attempts: 2, .. }
    ));

    let record = h.store.webhook_event("evt_flaky").unwrap();
    assert_eq!(record.status, WebhookEventStatus::DeadLetter);
    assert!(record.last_error.is_some());
    assert_eq!(h.plan_of(user.id), PlanTier::Free);

    // Dead letters are not reprocessed by later deliveries
    let third = h
        .billing
        .webhooks
        .process(&delivery("evt_flaky"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert_eq!(
        third,
        WebhookDisposition::Duplicate(WebhookEventStatus::DeadLetter)
    );
}

#[tokio::test]
async fn test_retry_after_failure_applies_event() {
    let h = Harness::new();
    let (user, sub) = h.pending("business").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    h.store.fail_next_plan_writes(1);
    let first = h
        .billing
        .webhooks
        .process(&delivery("evt_retry"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert!(first.wants_redelivery());

    let second = h
        .billing
        .webhooks
        .process(&delivery("evt_retry"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert!(matches!(second, WebhookDisposition::Processed(_)));
    assert_eq!(h.plan_of(user.id), PlanTier::Business);
    assert_eq!(h.store.webhook_event("evt_retry").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_malformed_event_dead_lettered_immediately() {
    let h = Harness::new();
    let disposition = h
        .billing
        .webhooks
        .process(&delivery("evt_bad"), std::future::ready(Err(BillingError::WebhookPayload(
            "unexpected object".into(),
        ))))
        .await
        .unwrap();
    assert!(matches!(
        disposition,
        WebhookDisposition::DeadLettered { attempts: 1, .. }
    ));
    let dead = h.store.list_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stripe_event_id, "evt_bad");
}

#[tokio::test]
async fn test_redelivery_while_in_flight_is_not_acknowledged() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    // First delivery claimed the event and never finished it
    h.store
        .claim_webhook_event("evt_in_flight", "invoice.payment_succeeded", "{}")
        .await
        .unwrap();

    let redelivery = h
        .billing
        .webhooks
        .process(&delivery("evt_in_flight"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert_eq!(redelivery, WebhookDisposition::InFlight);
    assert!(redelivery.wants_redelivery());
    assert_eq!(h.subscription(sub.id).status, SubscriptionStatus::Pending);
    assert_eq!(h.plan_of(user.id), PlanTier::Free);
}

#[tokio::test]
async fn test_abandoned_delivery_is_reclaimed() {
    let h = Harness::new();
    let (user, sub) = h.pending("pro").await;
    let paid = event(
        BillingEventKind::PaymentSucceeded,
        &sub,
        OffsetDateTime::now_utc(),
    );

    h.store
        .claim_webhook_event("evt_abandoned", "invoice.payment_succeeded", "{}")
        .await
        .unwrap();
    h.store.age_webhook_attempt("evt_abandoned", Duration::hours(1));

    let stuck = h.store.list_stuck_processing(10).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].stripe_event_id, "evt_abandoned");

    let redelivery = h
        .billing
        .webhooks
        .process(&delivery("evt_abandoned"), normalized(Some(paid.clone())))
        .await
        .unwrap();
    assert!(matches!(redelivery, WebhookDisposition::Processed(_)));
    assert_eq!(h.plan_of(user.id), PlanTier::Pro);

    let record = h.store.webhook_event("evt_abandoned").unwrap();
    assert_eq!(record.status, WebhookEventStatus::Success);
    assert_eq!(record.attempts, 2);
    assert!(h.store.list_stuck_processing(10).await.unwrap().is_empty());
}
