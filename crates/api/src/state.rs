//! Shared application state

use std::sync::Arc;

use axum::extract::FromRef;
use finplan_billing::BillingService;

use crate::auth::JwtManager;

/// Constructed once at startup and cloned into every handler
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub jwt: JwtManager,
}

impl AppState {
    pub fn new(billing: BillingService, jwt: JwtManager) -> Self {
        Self {
            billing: Arc::new(billing),
            jwt,
        }
    }
}

impl FromRef<AppState> for JwtManager {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}
