//! Entitlement Gate
//!
//! Runs before every quota-subject creation. Reads the user's plan and
//! current usage, then asks the quota evaluator for a decision.
//!
//! The check and the insert that follows it are separate steps, so two
//! concurrent creations can both pass at usage N-1 and land at N+1. That soft
//! cap is the default; [`crate::resources::QuotaEnforcement::Strict`] routes
//! creations through the store's locked count-then-insert instead.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::quota::{self, QuotaDecision, QuotaFeature};
use crate::store::UsageStore;

#[derive(Clone)]
pub struct EntitlementGate {
    store: Arc<dyn UsageStore>,
}

impl EntitlementGate {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Decide whether `user_id` may create one more `feature` item now.
    pub async fn try_reserve(
        &self,
        user_id: Uuid,
        feature: QuotaFeature,
    ) -> BillingResult<QuotaDecision> {
        self.try_reserve_at(user_id, feature, OffsetDateTime::now_utc())
            .await
    }

    /// Same as [`Self::try_reserve`] with an explicit clock.
    pub async fn try_reserve_at(
        &self,
        user_id: Uuid,
        feature: QuotaFeature,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaDecision> {
        let plan = self
            .store
            .user_plan(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        // Unlimited tiers skip the count entirely
        let usage = if quota::limit_for(plan, feature).is_none() {
            0
        } else {
            match feature {
                QuotaFeature::Transactions => {
                    let window = quota::month_window(now);
                    self.store
                        .count_transactions_between(user_id, window.first_day, window.last_day)
                        .await?
                }
                QuotaFeature::Goals => self.store.count_goals(user_id).await?,
            }
        };

        let decision = quota::evaluate(plan, feature, usage);
        if let QuotaDecision::Denied(reason) = &decision {
            tracing::info!(
                user_id = %user_id,
                feature = %feature,
                plan = %plan,
                usage = usage,
                reason = %reason,
                "Quota denied"
            );
        }

        Ok(decision)
    }
}
