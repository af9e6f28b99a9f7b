//! Error types for Finplan

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinplanError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown plan tier: {0}")]
    UnknownPlan(String),

    #[error("Unknown subscription status: {0}")]
    UnknownStatus(String),

    #[error("Unknown payment method: {0}")]
    UnknownPaymentMethod(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
