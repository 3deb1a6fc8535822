//! LTD customer administration

use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use repurpose_credits::{
    audit::action, export, LtdUserDetail, PlanChange, PlanSnapshot, UserFilter, UserPage,
};
use repurpose_shared::types::UserId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::shared::{csv_response, export_filename};
use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_REASON_LENGTH: usize = 500;

#[derive(Debug, Deserialize)]
pub struct CreditAdjustment {
    pub amount: i64,
    pub reason: String,
}

impl CreditAdjustment {
    fn validated_reason(&self) -> ApiResult<&str> {
        let reason = self.reason.trim();
        if reason.is_empty() {
            return Err(ApiError::Validation("reason is required".into()));
        }
        if reason.len() > MAX_REASON_LENGTH {
            return Err(ApiError::Validation(format!(
                "reason must be at most {} characters",
                MAX_REASON_LENGTH
            )));
        }
        Ok(reason)
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub credits: i64,
}

pub async fn list(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filter): Query<UserFilter>,
) -> ApiResult<Json<UserPage>> {
    Ok(Json(state.engine.admin.list_ltd_users(&filter).await?))
}

/// Every LTD user matching the filter as CSV. Audited.
pub async fn export(
    State(state): State<AppState>,
    admin: AdminUser,
    Query(filter): Query<UserFilter>,
) -> ApiResult<Response> {
    let users = state.engine.admin.all_ltd_users(&filter).await?;
    let body = export::users_csv(&users)?;
    state
        .engine
        .admin
        .record_export(admin.admin_id, action::EXPORT_USERS, users.len())
        .await?;

    tracing::info!(admin_id = %admin.admin_id, rows = users.len(), "Exported LTD users");
    Ok(csv_response(
        &export_filename("ltd-users", OffsetDateTime::now_utc()),
        body,
    ))
}

pub async fn detail(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<LtdUserDetail>> {
    Ok(Json(state.engine.admin.user_detail(UserId(user_id)).await?))
}

/// Change tier and/or monthly limit. Balances are left alone.
pub async fn change_plan(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(user_id): Path<Uuid>,
    Json(change): Json<PlanChange>,
) -> ApiResult<Json<PlanSnapshot>> {
    Ok(Json(
        state
            .engine
            .admin
            .change_plan(UserId(user_id), change, admin.admin_id)
            .await?,
    ))
}

pub async fn grant_credits(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<CreditAdjustment>,
) -> ApiResult<Json<BalanceResponse>> {
    let user_id = UserId(user_id);
    let reason = req.validated_reason()?;
    let credits = state
        .engine
        .admin
        .grant_credits(user_id, req.amount, reason, admin.admin_id)
        .await?;
    Ok(Json(BalanceResponse { user_id, credits }))
}

pub async fn set_credits(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<CreditAdjustment>,
) -> ApiResult<Json<BalanceResponse>> {
    let user_id = UserId(user_id);
    let reason = req.validated_reason()?;
    let credits = state
        .engine
        .admin
        .set_credits(user_id, req.amount, reason, admin.admin_id)
        .await?;
    Ok(Json(BalanceResponse { user_id, credits }))
}
