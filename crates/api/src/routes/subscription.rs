//! Subscription routes

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    http::StatusCode,
    Json,
};
use finplan_billing::{CheckoutConfirmation, SubscriptionSummary};
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiResult, routes::json_body, state::AppState};

/// Request to start a paid subscription
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSubscriptionRequest {
    pub plan: String,
    pub payment_method: String,
}

/// Current subscription, or `{ "plan": "free" }` when the user never subscribed
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let summary = state
        .billing
        .subscriptions
        .get_summary(auth_user.user_id)
        .await?;
    Ok(Json(summary))
}

/// Create a Pending subscription and return the payment confirmation secret
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CheckoutConfirmation>)> {
    let req = json_body(payload)?;

    let confirmation = state
        .billing
        .subscriptions
        .create(auth_user.user_id, &req.plan, &req.payment_method)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        subscription_id = %confirmation.subscription_id,
        "Subscription checkout started"
    );

    Ok((StatusCode::CREATED, Json(confirmation)))
}

/// Cancel the caller's Active subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let summary = state
        .billing
        .subscriptions
        .cancel(auth_user.user_id)
        .await?;
    Ok(Json(summary))
}
