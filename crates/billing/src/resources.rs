//! Quota-subject resources: transactions and goals.
//!
//! Every creation passes the entitlement gate first. Goal contributions are
//! applied as a single atomic increment in the store.

use std::str::FromStr;
use std::sync::Arc;

use finplan_shared::{Goal, NewGoal, NewTransaction, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::EntitlementGate;
use crate::error::{BillingError, BillingResult};
use crate::quota::{QuotaDecision, QuotaFeature};
use crate::store::{Reservation, UsageStore};

/// How strictly plan limits hold under concurrent creations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaEnforcement {
    /// Check, then insert. Concurrent requests may overshoot by a few.
    #[default]
    Soft,
    /// Count and insert under a per-user lock
    Strict,
}

impl FromStr for QuotaEnforcement {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "soft" => Ok(QuotaEnforcement::Soft),
            "strict" => Ok(QuotaEnforcement::Strict),
            other => Err(BillingError::Config(format!(
                "QUOTA_ENFORCEMENT must be soft or strict, got {}",
                other
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn UsageStore>,
    gate: EntitlementGate,
    enforcement: QuotaEnforcement,
}

impl ResourceService {
    pub fn new(store: Arc<dyn UsageStore>, enforcement: QuotaEnforcement) -> Self {
        Self {
            gate: EntitlementGate::new(store.clone()),
            store,
            enforcement,
        }
    }

    pub fn gate(&self) -> &EntitlementGate {
        &self.gate
    }

    pub async fn add_transaction(
        &self,
        user_id: Uuid,
        new: &NewTransaction,
    ) -> BillingResult<Transaction> {
        new.validate()?;

        let transaction = match self.enforcement {
            QuotaEnforcement::Soft => {
                match self.gate.try_reserve(user_id, QuotaFeature::Transactions).await? {
                    QuotaDecision::Allowed => self.store.insert_transaction(user_id, new).await?,
                    QuotaDecision::Denied(reason) => {
                        return Err(BillingError::QuotaExceeded(reason))
                    }
                }
            }
            QuotaEnforcement::Strict => match self
                .store
                .insert_transaction_checked(user_id, new, OffsetDateTime::now_utc())
                .await?
            {
                Reservation::Reserved(transaction) => transaction,
                Reservation::Denied(reason) => return Err(BillingError::QuotaExceeded(reason)),
            },
        };

        tracing::debug!(
            user_id = %user_id,
            transaction_id = %transaction.id,
            "Created transaction"
        );
        Ok(transaction)
    }

    pub async fn add_goal(&self, user_id: Uuid, new: &NewGoal) -> BillingResult<Goal> {
        new.validate()?;

        let goal = match self.enforcement {
            QuotaEnforcement::Soft => {
                match self.gate.try_reserve(user_id, QuotaFeature::Goals).await? {
                    QuotaDecision::Allowed => self.store.insert_goal(user_id, new).await?,
                    QuotaDecision::Denied(reason) => {
                        return Err(BillingError::QuotaExceeded(reason))
                    }
                }
            }
            QuotaEnforcement::Strict => match self.store.insert_goal_checked(user_id, new).await? {
                Reservation::Reserved(goal) => goal,
                Reservation::Denied(reason) => return Err(BillingError::QuotaExceeded(reason)),
            },
        };

        tracing::debug!(user_id = %user_id, goal_id = %goal.id, "Created goal");
        Ok(goal)
    }

    /// Add a contribution to a goal's progress.
    pub async fn increment_goal_progress(
        &self,
        user_id: Uuid,
        goal_id: Uuid,
        delta_cents: i64,
    ) -> BillingResult<Goal> {
        if delta_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "amount_cents must be positive".to_string(),
            ));
        }

        self.store
            .increment_goal_progress(user_id, goal_id, delta_cents)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("goal {}", goal_id)))
    }
}
