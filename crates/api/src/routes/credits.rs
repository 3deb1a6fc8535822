//! Credit balance routes for the calling user

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use repurpose_credits::{ActionUsage, ChargeOutcome, CreditAccess, CreditUsageEntry};
use serde::{Deserialize, Serialize};

use super::{ensure_plan, rejection_status};
use crate::{
    auth::CurrentUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;
const DEFAULT_ANALYTICS_DAYS: i32 = 30;

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    pub action: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub days: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub entries: Vec<CreditUsageEntry>,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsResponse {
    pub days: i32,
    pub total_credits_used: i64,
    pub actions: Vec<ActionUsage>,
}

/// Price of an action and whether the balance covers it. Never deducts.
pub async fn check(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<CreditAccess>> {
    ensure_plan(&state, &user).await?;
    Ok(Json(
        state
            .engine
            .gate
            .check_credit_access(user.user_id, &query.action)
            .await?,
    ))
}

/// Charge a completed action: feature gate, monthly cap, then balance
pub async fn deduct(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<DeductRequest>,
) -> ApiResult<(StatusCode, Json<ChargeOutcome>)> {
    ensure_plan(&state, &user).await?;
    let outcome = state
        .engine
        .charge_action(user.user_id, &req.action, req.metadata)
        .await?;

    let status = match &outcome {
        ChargeOutcome::Charged { .. } => StatusCode::OK,
        ChargeOutcome::Rejected { reason, .. } => rejection_status(*reason),
    };
    Ok((status, Json(outcome)))
}

pub async fn history(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_HISTORY_LIMIT
        )));
    }

    let entries = state.engine.ledger.usage_history(user.user_id, limit).await?;
    Ok(Json(HistoryResponse { entries }))
}

/// Debits grouped by action over the last `days` days
pub async fn analytics(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<AnalyticsResponse>> {
    let days = query.days.unwrap_or(DEFAULT_ANALYTICS_DAYS);
    let actions = state.engine.ledger.usage_analytics(user.user_id, days).await?;
    let total_credits_used = actions.iter().map(|a| a.total_credits_used).sum();

    Ok(Json(AnalyticsResponse {
        days,
        total_credits_used,
        actions,
    }))
}
