//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use finplan_billing::{BillingError, ErrorClass};
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("No active subscription found")]
    NoActiveSubscription,
    #[error("User already has an active subscription")]
    AlreadySubscribed,

    // Billing errors
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::NoActiveSubscription => (StatusCode::NOT_FOUND, "NO_ACTIVE_SUBSCRIPTION", self.to_string()),
            ApiError::AlreadySubscribed => (StatusCode::CONFLICT, "ALREADY_SUBSCRIBED", self.to_string()),

            // Billing
            ApiError::QuotaExceeded(msg) => (StatusCode::PAYMENT_REQUIRED, "QUOTA_EXCEEDED", msg.clone()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::QuotaExceeded(reason) => ApiError::QuotaExceeded(reason),
            BillingError::AlreadySubscribed => ApiError::AlreadySubscribed,
            BillingError::NoActiveSubscription => ApiError::NoActiveSubscription,
            BillingError::InvalidTier(tier) => {
                ApiError::Validation(format!("Unknown plan '{}'", tier))
            }
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            err => match err.class() {
                ErrorClass::Validation => ApiError::BadRequest(err.to_string()),
                ErrorClass::NotFound => ApiError::NotFound,
                ErrorClass::Transient | ErrorClass::PartialCommit => {
                    tracing::warn!(error = %err, "Billing operation failed, retryable");
                    ApiError::ServiceUnavailable
                }
                ErrorClass::EntitlementDenied | ErrorClass::Internal => {
                    tracing::error!(error = %err, "Billing operation failed");
                    ApiError::Internal
                }
            },
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
