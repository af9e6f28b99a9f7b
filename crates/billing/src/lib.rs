// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Finplan Billing Module
//!
//! Subscription and entitlement engine for Finplan.
//!
//! ## Features
//!
//! - **Quota Evaluation**: Pure plan-limit decisions per feature
//! - **Entitlement Gate**: Checks plan and usage before every quota-subject creation
//! - **Subscriptions**: Create (pending until paid), summarize, cancel
//! - **Reconciliation**: Applies processor events atomically with the user's plan
//! - **Webhooks**: Verified, idempotent, retried, dead-lettered
//! - **Invariants**: Scheduled consistency checks over stored state

pub mod audit;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod memory;
pub mod notifications;
pub mod pg_store;
pub mod processor;
pub mod quota;
pub mod reconciler;
pub mod resources;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

// Audit
pub use audit::{ActorType, AuditEventBuilder, AuditEventType, AuditLogger, NewAuditEvent};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Entitlement
pub use entitlement::EntitlementGate;

// Error
pub use error::{BillingError, BillingResult, ErrorClass};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notifications::{NotificationSink, PgNotificationSink, PAYMENT_FAILED_MESSAGE};

// Storage
pub use pg_store::PgStore;
pub use store::{
    CommitOutcome, Reservation, StatusTransition, SubscriptionStore, UsageStore, WebhookClaim,
    WebhookEventRecord, WebhookEventStatus, WebhookEventStore, STALE_PROCESSING_MINUTES,
};

// Processor
pub use processor::{PaymentProcessor, ProcessorSubscription};

// Quota
pub use quota::{QuotaDecision, QuotaFeature, FREE_MONTHLY_TRANSACTIONS, FREE_TOTAL_GOALS};

// Reconciliation
pub use reconciler::{
    BillingEvent, BillingEventKind, BillingReconciler, DropReason, EventMetadata,
    ReconcileOutcome,
};

// Resources
pub use resources::{QuotaEnforcement, ResourceService};

// Subscriptions
pub use subscriptions::{CheckoutConfirmation, SubscriptionService, SubscriptionSummary};

// Webhooks
pub use webhooks::{WebhookDelivery, WebhookDisposition, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Tunables read from the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingSettings {
    pub quota_enforcement: QuotaEnforcement,
    pub webhook_max_attempts: i32,
    pub commit_attempts: usize,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            quota_enforcement: QuotaEnforcement::Soft,
            webhook_max_attempts: webhooks::DEFAULT_MAX_ATTEMPTS,
            commit_attempts: reconciler::DEFAULT_COMMIT_ATTEMPTS,
        }
    }
}

impl BillingSettings {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let quota_enforcement = match std::env::var("QUOTA_ENFORCEMENT") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.quota_enforcement,
        };

        let settings = Self {
            quota_enforcement,
            webhook_max_attempts: env_number("WEBHOOK_MAX_ATTEMPTS", defaults.webhook_max_attempts)?,
            commit_attempts: env_number("RECONCILE_COMMIT_ATTEMPTS", defaults.commit_attempts)?,
        };

        if settings.webhook_max_attempts < 1 || settings.commit_attempts < 1 {
            return Err(BillingError::Config(
                "WEBHOOK_MAX_ATTEMPTS and RECONCILE_COMMIT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(settings)
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| BillingError::Config(format!("{} must be a number", name))),
        Err(_) => Ok(default),
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub resources: ResourceService,
    pub reconciler: Arc<BillingReconciler>,
    pub webhooks: WebhookHandler,
    store: Arc<dyn SubscriptionStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let settings = BillingSettings::from_env()?;
        Ok(Self::new(config, pool, settings))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool, settings: BillingSettings) -> Self {
        let webhook_secret = config.webhook_secret.clone();
        Self::with_store(
            Arc::new(PgStore::new(pool.clone())),
            Arc::new(StripeClient::new(config)),
            Arc::new(PgNotificationSink::new(pool)),
            webhook_secret,
            settings,
        )
    }

    /// Assemble the service over any store implementation
    pub fn with_store<S>(
        store: Arc<S>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn NotificationSink>,
        webhook_secret: String,
        settings: BillingSettings,
    ) -> Self
    where
        S: SubscriptionStore + UsageStore + WebhookEventStore + 'static,
    {
        let subscription_store: Arc<dyn SubscriptionStore> = store.clone();
        let reconciler = Arc::new(BillingReconciler::new(
            subscription_store.clone(),
            notifier,
            settings.commit_attempts,
        ));

        Self {
            subscriptions: SubscriptionService::new(
                subscription_store.clone(),
                processor.clone(),
                reconciler.clone(),
            ),
            resources: ResourceService::new(store.clone(), settings.quota_enforcement),
            webhooks: WebhookHandler::new(
                webhook_secret,
                store,
                processor,
                reconciler.clone(),
                settings.webhook_max_attempts,
            ),
            reconciler,
            store: subscription_store,
        }
    }

    /// Whether the backing store answers
    pub async fn health_check(&self) -> BillingResult<()> {
        self.store.ping().await
    }
}
