//! Payment processor seam.
//!
//! Everything the engine asks of Stripe goes through [`PaymentProcessor`],
//! implemented for [`StripeClient`]. Tests substitute a fake.

use std::collections::HashMap;

use async_trait::async_trait;
use finplan_shared::{PlanTier, User};
use stripe::{
    CancelSubscription, CreateCustomer, CreateSubscription, CreateSubscriptionItems, Customer,
    CustomerId, Expandable, Subscription, SubscriptionId, SubscriptionPaymentBehavior,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Processor-side subscription awaiting client confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub external_ref: String,
    pub client_secret: String,
    pub payment_intent_id: Option<String>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a customer for `user`, returning its processor id
    async fn create_customer(&self, user: &User) -> BillingResult<String>;

    /// Create an incomplete subscription the client confirms with the
    /// returned secret
    async fn create_subscription(
        &self,
        customer_id: &str,
        tier: PlanTier,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ProcessorSubscription>;

    async fn cancel_subscription(&self, external_ref: &str) -> BillingResult<()>;

    /// Metadata stamped on the subscription at creation
    async fn subscription_metadata(
        &self,
        external_ref: &str,
    ) -> BillingResult<HashMap<String, String>>;
}

fn parse_subscription_id(external_ref: &str) -> BillingResult<SubscriptionId> {
    external_ref
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(&self, user: &User) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user.id.to_string());

        let params = CreateCustomer {
            email: Some(&user.email),
            name: Some(&user.name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.inner(), params).await?;

        tracing::info!(
            user_id = %user.id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        tier: PlanTier,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ProcessorSubscription> {
        let price_id = self
            .config()
            .price_id_for_tier(tier)
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?;

        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = Subscription::create(self.inner(), params).await?;

        let payment_intent = match subscription.latest_invoice.as_ref() {
            Some(Expandable::Object(invoice)) => match invoice.payment_intent.as_ref() {
                Some(Expandable::Object(intent)) => Some(intent.as_ref()),
                _ => None,
            },
            _ => None,
        };

        let client_secret = payment_intent
            .and_then(|intent| intent.client_secret.clone())
            .ok_or_else(|| {
                BillingError::StripeApi(format!(
                    "Subscription {} returned without a payment intent client secret",
                    subscription.id
                ))
            })?;

        tracing::info!(
            subscription_id = %subscription.id,
            tier = %tier,
            "Created Stripe subscription"
        );

        Ok(ProcessorSubscription {
            external_ref: subscription.id.to_string(),
            client_secret,
            payment_intent_id: payment_intent.map(|intent| intent.id.to_string()),
        })
    }

    async fn cancel_subscription(&self, external_ref: &str) -> BillingResult<()> {
        let subscription_id = parse_subscription_id(external_ref)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };
        Subscription::cancel(self.inner(), &subscription_id, params).await?;

        tracing::info!(subscription_id = %external_ref, "Canceled Stripe subscription");
        Ok(())
    }

    async fn subscription_metadata(
        &self,
        external_ref: &str,
    ) -> BillingResult<HashMap<String, String>> {
        let subscription_id = parse_subscription_id(external_ref)?;
        let subscription = Subscription::retrieve(self.inner(), &subscription_id, &[]).await?;
        Ok(subscription.metadata)
    }
}
