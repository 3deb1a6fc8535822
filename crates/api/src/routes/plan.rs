//! Plan, redemption and entitlement routes for the calling user

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use repurpose_credits::{
    AccessDecision, CodeValidation, CounterFeature, Feature, LimitCheck, PlanSnapshot,
    RedeemOutcome, RedemptionRecord, TierFeatures,
};
use serde::{Deserialize, Serialize};

use super::{ensure_plan, rejection_status};
use crate::{
    auth::CurrentUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: PlanSnapshot,
    pub plan_name: String,
    pub features: TierFeatures,
    pub redemptions: Vec<RedemptionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub code: String,
}

/// Current plan, entitlements and redemption history
pub async fn get_plan(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<PlanResponse>> {
    let plan = ensure_plan(&state, &user).await?;
    let config = state.engine.tiers.plan(plan.plan_type, plan.ltd_tier)?;
    let redemptions = state.engine.redemptions.user_redemptions(user.user_id).await?;

    Ok(Json(PlanResponse {
        plan: plan.snapshot(),
        plan_name: config.name.clone(),
        features: config.features.clone(),
        redemptions,
    }))
}

/// Redeem a code for the calling user
pub async fn redeem(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<RedeemRequest>,
) -> ApiResult<(StatusCode, Json<RedeemOutcome>)> {
    if req.code.trim().is_empty() {
        return Err(ApiError::Validation("code is required".into()));
    }
    ensure_plan(&state, &user).await?;

    let outcome = state.engine.redemptions.redeem(user.user_id, &req.code).await?;

    let status = match &outcome {
        RedeemOutcome::Redeemed { .. } => StatusCode::OK,
        RedeemOutcome::Rejected { reason, .. } => {
            tracing::info!(user_id = %user.user_id, reason = %reason.as_str(), "redeem: rejected");
            rejection_status(*reason)
        }
    };
    Ok((status, Json(outcome)))
}

/// Check a code without redeeming it
pub async fn validate_code(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<ValidateQuery>,
) -> ApiResult<Json<CodeValidation>> {
    Ok(Json(state.engine.codes.validate_code(&query.code).await?))
}

pub async fn check_feature(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(feature): Path<String>,
) -> ApiResult<Json<AccessDecision>> {
    let feature: Feature = feature.parse()?;
    ensure_plan(&state, &user).await?;
    Ok(Json(
        state
            .engine
            .gate
            .check_feature_access(user.user_id, feature)
            .await?,
    ))
}

/// This month's count against the caller's cap for one counter
pub async fn usage(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(counter): Path<String>,
) -> ApiResult<Json<LimitCheck>> {
    let counter: CounterFeature = counter.parse()?;
    let plan = ensure_plan(&state, &user).await?;
    let limit = state
        .engine
        .tiers
        .plan(plan.plan_type, plan.ltd_tier)?
        .features
        .counter_limit(counter);

    Ok(Json(
        state
            .engine
            .counters
            .check_against(user.user_id, counter, limit)
            .await?,
    ))
}
