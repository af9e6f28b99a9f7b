//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use finplan_billing::WebhookDisposition;

use crate::{error::ApiError, state::AppState};

/// Receive a Stripe event.
///
/// Answers 503 while a failed delivery still has attempts left, or while
/// another delivery of the same event is mid-flight, so Stripe redelivers it.
/// Everything else, dead letters included, is acknowledged.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::BadRequest("Invalid webhook signature or payload".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let disposition = state.billing.webhooks.handle_event(&event, &body).await?;

    match disposition {
        WebhookDisposition::RetryLater { attempts, .. } => {
            tracing::warn!(
                event_id = %event.id,
                attempts = attempts,
                "Asking Stripe to redeliver webhook"
            );
            Err(ApiError::ServiceUnavailable)
        }
        WebhookDisposition::InFlight => {
            tracing::warn!(
                event_id = %event.id,
                "Webhook event still processing, asking Stripe to redeliver"
            );
            Err(ApiError::ServiceUnavailable)
        }
        _ => Ok(StatusCode::OK),
    }
}
