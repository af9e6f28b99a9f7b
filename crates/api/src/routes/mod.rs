//! API routes

pub mod health;
pub mod resources;
pub mod subscription;
pub mod webhooks;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::{auth::require_auth, error::ApiError, state::AppState};

/// Unwrap a JSON body, reporting malformed or incomplete input as a
/// validation error in the API's error format
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::Validation(rejection.body_text()))
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Stripe webhook (public, uses signature verification)
    let public_routes = Router::new().route("/webhooks/stripe", post(webhooks::stripe_webhook));

    // Protected routes (bearer token required)
    let protected_routes = Router::new()
        .route(
            "/subscription",
            get(subscription::get_subscription).post(subscription::create_subscription),
        )
        .route("/subscription/cancel", post(subscription::cancel_subscription))
        .route("/transactions", post(resources::create_transaction))
        .route("/goals", post(resources::create_goal))
        .route("/goals/:goal_id/progress", put(resources::add_goal_progress))
        .layer(middleware::from_fn_with_state(state.jwt.clone(), require_auth));

    Router::new()
        .merge(health_routes)
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
