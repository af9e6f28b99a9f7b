//! In-memory implementations for tests and local development.
//!
//! [`InMemoryStore`] implements every storage trait behind a single mutex, so
//! each trait method is trivially atomic. It also supports fault injection for
//! exercising the reconciler's rollback and retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use finplan_shared::{
    Goal, NewGoal, NewSubscription, NewTransaction, PlanTier, Subscription, SubscriptionStatus,
    Transaction, User, UserUpdate,
};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::audit::NewAuditEvent;
use crate::error::{BillingError, BillingResult};
use crate::notifications::NotificationSink;
use crate::processor::{PaymentProcessor, ProcessorSubscription};
use crate::quota::{self, QuotaDecision, QuotaFeature};
use crate::store::{
    CommitOutcome, Reservation, StatusTransition, SubscriptionStore, UsageStore, WebhookClaim,
    WebhookEventRecord, WebhookEventStatus, WebhookEventStore, STALE_PROCESSING_MINUTES,
};

/// In-memory billing store.
///
/// Wraps data in Arc for cheap cloning.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    subscriptions: Vec<Subscription>,
    transactions: Vec<Transaction>,
    goals: HashMap<Uuid, Goal>,
    audit_events: Vec<NewAuditEvent>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    plan_write_failures: u32,
    transient_commit_failures: u32,
}

impl State {
    fn active_plan(&self, user_id: Uuid) -> PlanTier {
        self.subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .map(|s| s.plan)
            .unwrap_or(PlanTier::Free)
    }

    fn has_other_active(&self, user_id: Uuid, except: Uuid) -> bool {
        self.subscriptions.iter().any(|s| {
            s.user_id == user_id && s.id != except && s.status == SubscriptionStatus::Active
        })
    }

    fn usage(&self, user_id: Uuid, feature: QuotaFeature, now: OffsetDateTime) -> u64 {
        match feature {
            QuotaFeature::Transactions => {
                let window = quota::month_window(now);
                self.transactions
                    .iter()
                    .filter(|t| {
                        t.user_id == user_id
                            && t.date >= window.first_day
                            && t.date <= window.last_day
                    })
                    .count() as u64
            }
            QuotaFeature::Goals => self.goals.values().filter(|g| g.user_id == user_id).count() as u64,
        }
    }

    fn push_transaction(&mut self, user_id: Uuid, new: &NewTransaction) -> Transaction {
        let transaction = Transaction {
            id: Uuid::new_v4(),
            user_id,
            kind: new.kind,
            amount_cents: new.amount_cents,
            category: new.category.clone(),
            description: new.description.clone(),
            date: new.date,
            recurring: new.recurring,
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    fn push_goal(&mut self, user_id: Uuid, new: &NewGoal) -> Goal {
        let goal = Goal {
            id: Uuid::new_v4(),
            user_id,
            name: new.name.clone(),
            target_amount_cents: new.target_amount_cents,
            current_amount_cents: new.current_amount_cents,
            target_date: new.target_date,
            priority: new.priority,
        };
        self.goals.insert(goal.id, goal.clone());
        goal
    }

    fn plan_of(&self, user_id: Uuid) -> BillingResult<PlanTier> {
        self.users
            .get(&user_id)
            .map(|u| u.plan)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a user on `plan`
    pub fn seed_user(&self, email: &str, plan: PlanTier) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: email.split('@').next().unwrap_or(email).to_string(),
            plan,
            stripe_customer_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.lock().users.insert(user.id, user.clone());
        user
    }

    /// Insert a subscription record verbatim, bypassing single-active checks
    pub fn seed_subscription(&self, subscription: Subscription) {
        self.lock().subscriptions.push(subscription);
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.lock().users.get(&user_id).cloned()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.lock().subscriptions.clone()
    }

    pub fn audit_events(&self) -> Vec<NewAuditEvent> {
        self.lock().audit_events.clone()
    }

    pub fn goal(&self, goal_id: Uuid) -> Option<Goal> {
        self.lock().goals.get(&goal_id).cloned()
    }

    pub fn webhook_event(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.lock().webhook_events.get(event_id).cloned()
    }

    /// Move a delivery's last attempt back by `by`, as if it had been
    /// claimed that long ago
    pub fn age_webhook_attempt(&self, event_id: &str, by: time::Duration) {
        if let Some(record) = self.lock().webhook_events.get_mut(event_id) {
            record.last_attempt_at = record.last_attempt_at.map(|at| at - by);
        }
    }

    /// Make the next `n` status commits fail on the user plan write after
    /// the subscription write has been staged. The commit is rolled back.
    pub fn fail_next_plan_writes(&self, n: u32) {
        self.lock().plan_write_failures = n;
    }

    /// Make the next `n` status commits fail with a transient database error
    pub fn fail_next_commits(&self, n: u32) {
        self.lock().transient_commit_failures = n;
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    async fn update_user(&self, user_id: Uuid, update: &UserUpdate) -> BillingResult<bool> {
        let mut state = self.lock();
        let Some(user) = state.users.get_mut(&user_id) else {
            return Ok(false);
        };
        if let Some(name) = &update.name {
            user.name = name.clone();
        }
        if let Some(customer_id) = &update.stripe_customer_id {
            user.stripe_customer_id = Some(customer_id.clone());
        }
        Ok(true)
    }

    async fn create_subscription(&self, new: &NewSubscription) -> BillingResult<Subscription> {
        let mut state = self.lock();
        if state
            .subscriptions
            .iter()
            .any(|s| s.stripe_subscription_id == new.stripe_subscription_id)
        {
            return Err(BillingError::Database(format!(
                "duplicate stripe_subscription_id {}",
                new.stripe_subscription_id
            )));
        }
        if new.status == SubscriptionStatus::Active && state.has_other_active(new.user_id, Uuid::nil())
        {
            return Err(BillingError::AlreadySubscribed);
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            plan: new.plan,
            status: new.status,
            start_date: OffsetDateTime::now_utc(),
            end_date: None,
            payment_method: new.payment_method,
            stripe_subscription_id: new.stripe_subscription_id.clone(),
            last_event_at: None,
        };
        state.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn find_latest_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        // Later pushes win ties on start_date
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .fold(None::<&Subscription>, |latest, s| match latest {
                Some(l) if l.start_date > s.start_date => Some(l),
                _ => Some(s),
            })
            .cloned())
    }

    async fn find_by_external_ref(
        &self,
        external_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id == external_ref)
            .cloned())
    }

    async fn update_status(&self, transition: &StatusTransition) -> BillingResult<CommitOutcome> {
        let mut state = self.lock();

        if state.transient_commit_failures > 0 {
            state.transient_commit_failures -= 1;
            return Err(BillingError::Database("connection reset".to_string()));
        }

        let Some(index) = state.subscriptions.iter().position(|s| {
            s.id == transition.subscription_id
                && s.status == transition.expected_status
                && s.last_event_at == transition.expected_last_event_at
        }) else {
            return Ok(CommitOutcome::Conflict);
        };

        // Stage on a copy; nothing is visible until both writes succeed
        let mut staged = state.subscriptions[index].clone();
        transition.update.apply_to(&mut staged);

        if staged.status == SubscriptionStatus::Active
            && state.has_other_active(staged.user_id, staged.id)
        {
            return Err(BillingError::AlreadySubscribed);
        }

        if !state.users.contains_key(&transition.user_id) {
            return Err(BillingError::PartialCommit {
                subscription_id: staged.id,
                reason: format!("user {} not found", transition.user_id),
            });
        }
        if state.plan_write_failures > 0 {
            state.plan_write_failures -= 1;
            return Err(BillingError::PartialCommit {
                subscription_id: staged.id,
                reason: "injected user plan write failure".to_string(),
            });
        }

        state.subscriptions[index] = staged.clone();
        let user_plan = state.active_plan(transition.user_id);
        if let Some(user) = state.users.get_mut(&transition.user_id) {
            user.plan = user_plan;
        }

        Ok(CommitOutcome::Committed {
            subscription: staged,
            user_plan,
        })
    }

    async fn append_audit_event(&self, event: &NewAuditEvent) -> BillingResult<Uuid> {
        self.lock().audit_events.push(event.clone());
        Ok(Uuid::new_v4())
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn user_plan(&self, user_id: Uuid) -> BillingResult<Option<PlanTier>> {
        Ok(self.lock().users.get(&user_id).map(|u| u.plan))
    }

    async fn count_transactions_between(
        &self,
        user_id: Uuid,
        first_day: Date,
        last_day: Date,
    ) -> BillingResult<u64> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.date >= first_day && t.date <= last_day)
            .count() as u64)
    }

    async fn count_goals(&self, user_id: Uuid) -> BillingResult<u64> {
        Ok(self
            .lock()
            .goals
            .values()
            .filter(|g| g.user_id == user_id)
            .count() as u64)
    }

    async fn insert_transaction(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
    ) -> BillingResult<Transaction> {
        Ok(self.lock().push_transaction(user_id, new))
    }

    async fn insert_goal(&self, user_id: Uuid, new: &NewGoal) -> BillingResult<Goal> {
        Ok(self.lock().push_goal(user_id, new))
    }

    async fn insert_transaction_checked(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
        now: OffsetDateTime,
    ) -> BillingResult<Reservation<Transaction>> {
        let mut state = self.lock();
        let plan = state.plan_of(user_id)?;
        let usage = state.usage(user_id, QuotaFeature::Transactions, now);
        match quota::evaluate(plan, QuotaFeature::Transactions, usage) {
            QuotaDecision::Allowed => Ok(Reservation::Reserved(
                state.push_transaction(user_id, new),
            )),
            QuotaDecision::Denied(reason) => Ok(Reservation::Denied(reason)),
        }
    }

    async fn insert_goal_checked(
        &self,
        user_id: Uuid,
        new: &NewGoal,
    ) -> BillingResult<Reservation<Goal>> {
        let mut state = self.lock();
        let plan = state.plan_of(user_id)?;
        let usage = state.usage(user_id, QuotaFeature::Goals, OffsetDateTime::now_utc());
        match quota::evaluate(plan, QuotaFeature::Goals, usage) {
            QuotaDecision::Allowed => Ok(Reservation::Reserved(state.push_goal(user_id, new))),
            QuotaDecision::Denied(reason) => Ok(Reservation::Denied(reason)),
        }
    }

    async fn increment_goal_progress(
        &self,
        user_id: Uuid,
        goal_id: Uuid,
        delta_cents: i64,
    ) -> BillingResult<Option<Goal>> {
        let mut state = self.lock();
        match state.goals.get_mut(&goal_id) {
            Some(goal) if goal.user_id == user_id => {
                goal.current_amount_cents += delta_cents;
                Ok(Some(goal.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryStore {
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        _payload: &str,
    ) -> BillingResult<WebhookClaim> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();
        match state.webhook_events.get_mut(event_id) {
            Some(record)
                if record.status == WebhookEventStatus::Failed
                    || (record.status == WebhookEventStatus::Processing
                        && is_abandoned(record.last_attempt_at, now)) =>
            {
                record.status = WebhookEventStatus::Processing;
                record.attempts += 1;
                record.last_attempt_at = Some(now);
                Ok(WebhookClaim::Claimed {
                    attempts: record.attempts,
                })
            }
            Some(record) => Ok(WebhookClaim::AlreadyHandled(record.status)),
            None => {
                state.webhook_events.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        stripe_event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        status: WebhookEventStatus::Processing,
                        attempts: 1,
                        last_error: None,
                        last_attempt_at: Some(now),
                        created_at: now,
                    },
                );
                Ok(WebhookClaim::Claimed { attempts: 1 })
            }
        }
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.lock();
        let record = state
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;
        record.status = status;
        record.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn list_dead_letters(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.lock();
        let mut dead: Vec<WebhookEventRecord> = state
            .webhook_events
            .values()
            .filter(|r| r.status == WebhookEventStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by_key(|r| r.created_at);
        dead.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(dead)
    }

    async fn list_stuck_processing(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let now = OffsetDateTime::now_utc();
        let state = self.lock();
        let mut stuck: Vec<WebhookEventRecord> = state
            .webhook_events
            .values()
            .filter(|r| r.status == WebhookEventStatus::Processing && is_abandoned(r.last_attempt_at, now))
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.last_attempt_at);
        stuck.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stuck)
    }

    async fn purge_webhook_events(&self, days: i32) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(days));
        let mut state = self.lock();
        let before = state.webhook_events.len();
        state.webhook_events.retain(|_, r| {
            !(matches!(
                r.status,
                WebhookEventStatus::Success | WebhookEventStatus::Ignored
            ) && r.created_at < cutoff)
        });
        Ok((before - state.webhook_events.len()) as u64)
    }
}

fn is_abandoned(last_attempt_at: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    last_attempt_at.map_or(true, |at| {
        now - at > time::Duration::minutes(i64::from(STALE_PROCESSING_MINUTES))
    })
}

/// Records notifications instead of delivering them
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delivery fail
    pub fn fail_deliveries(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(Uuid, String)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, message: &str) -> BillingResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::Internal("notification outbox unavailable".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user_id, message.to_string()));
        Ok(())
    }
}

/// Processor double that hands out sequential ids
#[derive(Default)]
pub struct FakeProcessor {
    next_id: AtomicU32,
    metadata: Mutex<HashMap<String, HashMap<String, String>>>,
    canceled: Mutex<Vec<String>>,
    customers_created: AtomicU32,
    fail_cancel: AtomicBool,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn customers_created(&self) -> u32 {
        self.customers_created.load(Ordering::SeqCst)
    }

    /// Make cancellation requests fail as if the processor were down
    pub fn fail_cancellations(&self) {
        self.fail_cancel.store(true, Ordering::SeqCst);
    }

    /// Register metadata for a subscription created outside this double
    pub fn set_metadata(&self, external_ref: &str, metadata: HashMap<String, String>) {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external_ref.to_string(), metadata);
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_customer(&self, _user: &User) -> BillingResult<String> {
        let n = self.customers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("cus_fake_{}", n))
    }

    async fn create_subscription(
        &self,
        _customer_id: &str,
        tier: PlanTier,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ProcessorSubscription> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidTier(tier.to_string()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let external_ref = format!("sub_fake_{}", n);
        self.set_metadata(&external_ref, metadata);
        Ok(ProcessorSubscription {
            external_ref,
            client_secret: format!("pi_fake_{}_secret", n),
            payment_intent_id: Some(format!("pi_fake_{}", n)),
        })
    }

    async fn cancel_subscription(&self, external_ref: &str) -> BillingResult<()> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi("processor unavailable".into()));
        }
        self.canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(external_ref.to_string());
        Ok(())
    }

    async fn subscription_metadata(
        &self,
        external_ref: &str,
    ) -> BillingResult<HashMap<String, String>> {
        Ok(self
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(external_ref)
            .cloned()
            .unwrap_or_default())
    }
}
