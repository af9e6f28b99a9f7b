//! Transaction and goal routes. Creation is subject to plan limits.

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, State},
    http::StatusCode,
    Json,
};
use finplan_shared::{Goal, NewGoal, NewTransaction, Transaction};
use serde::Deserialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, routes::json_body, state::AppState};

/// Contribution to a goal
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoalProgressRequest {
    pub amount_cents: i64,
}

pub async fn create_transaction(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<NewTransaction>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    let new = json_body(payload)?;
    let transaction = state
        .billing
        .resources
        .add_transaction(auth_user.user_id, &new)
        .await?;
    Ok((StatusCode::CREATED, Json(transaction)))
}

pub async fn create_goal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<NewGoal>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Goal>)> {
    let new = json_body(payload)?;
    let goal = state
        .billing
        .resources
        .add_goal(auth_user.user_id, &new)
        .await?;
    Ok((StatusCode::CREATED, Json(goal)))
}

/// Atomically add `amount_cents` to the goal's progress
pub async fn add_goal_progress(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(goal_id): Path<Uuid>,
    payload: Result<Json<GoalProgressRequest>, JsonRejection>,
) -> ApiResult<Json<Goal>> {
    let req = json_body(payload)?;
    let goal = state
        .billing
        .resources
        .increment_goal_progress(auth_user.user_id, goal_id, req.amount_cents)
        .await?;
    Ok(Json(goal))
}
