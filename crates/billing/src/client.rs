//! Stripe client configuration

use finplan_shared::PlanTier;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each paid plan
    pub price_ids: PriceIds,
}

/// Stripe price IDs for paid plans (monthly)
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub pro: String,
    pub business: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                pro: std::env::var("STRIPE_PRICE_PRO")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_PRO not set".to_string()))?,
                business: std::env::var("STRIPE_PRICE_BUSINESS").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_BUSINESS not set".to_string())
                })?,
            },
        })
    }

    /// Get price ID for a paid tier
    pub fn price_id_for_tier(&self, tier: PlanTier) -> Option<&str> {
        match tier {
            PlanTier::Pro => Some(&self.price_ids.pro),
            PlanTier::Business => Some(&self.price_ids.business),
            PlanTier::Free => None,
        }
    }

    /// Get tier from price ID
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<PlanTier> {
        if price_id == self.price_ids.pro {
            Some(PlanTier::Pro)
        } else if price_id == self.price_ids.business {
            Some(PlanTier::Business)
        } else {
            None
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
