//! Redemption code administration

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use repurpose_credits::{
    audit::action, export, CodeFilter, CodePage, CodeSelector, CodeStatistics, CodeUpdate,
    GenerateCodesRequest, GeneratedBatch, LtdCode,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::shared::{csv_response, export_filename};
use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_EXPIRING_DAYS: i64 = 30;

pub async fn generate(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<GenerateCodesRequest>,
) -> ApiResult<(StatusCode, Json<GeneratedBatch>)> {
    let batch = state.engine.codes.generate_codes(req, admin.admin_id).await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn list(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filter): Query<CodeFilter>,
) -> ApiResult<Json<CodePage>> {
    Ok(Json(state.engine.codes.list_codes(&filter).await?))
}

pub async fn statistics(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<CodeStatistics>> {
    Ok(Json(state.engine.codes.code_statistics().await?))
}

#[derive(Debug, Deserialize)]
pub struct ExpiringQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CodeListResponse {
    pub codes: Vec<LtdCode>,
}

/// Usable codes expiring soon
pub async fn expiring(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ExpiringQuery>,
) -> ApiResult<Json<CodeListResponse>> {
    let codes = state
        .engine
        .codes
        .expiring_codes(query.days.unwrap_or(DEFAULT_EXPIRING_DAYS))
        .await?;
    Ok(Json(CodeListResponse { codes }))
}

/// Every code matching the filter as CSV. Audited.
pub async fn export(
    State(state): State<AppState>,
    admin: AdminUser,
    Query(filter): Query<CodeFilter>,
) -> ApiResult<Response> {
    let codes = state.engine.codes.all_codes(&filter).await?;
    let body = export::codes_csv(&codes)?;
    state
        .engine
        .admin
        .record_export(admin.admin_id, action::EXPORT_CODES, codes.len())
        .await?;

    tracing::info!(admin_id = %admin.admin_id, rows = codes.len(), "Exported codes");
    Ok(csv_response(
        &export_filename("ltd-codes", OffsetDateTime::now_utc()),
        body,
    ))
}

pub async fn get_code(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<LtdCode>> {
    state
        .engine
        .codes
        .get_code(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("code {}", id)))
}

pub async fn update(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<i64>,
    Json(changes): Json<CodeUpdate>,
) -> ApiResult<Json<LtdCode>> {
    Ok(Json(
        state.engine.codes.update_code(id, changes, admin.admin_id).await?,
    ))
}

/// Delete a code that was never redeemed
pub async fn delete(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.engine.codes.delete_code(id, admin.admin_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Activate,
    Deactivate,
    DeleteUnredeemed,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub operation: BulkOperation,
    pub selector: CodeSelector,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub affected: u64,
}

pub async fn bulk(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(req): Json<BulkRequest>,
) -> ApiResult<Json<BulkResponse>> {
    let codes = &state.engine.codes;
    let affected = match req.operation {
        BulkOperation::Activate => codes.set_active(req.selector, true, admin.admin_id).await?,
        BulkOperation::Deactivate => codes.set_active(req.selector, false, admin.admin_id).await?,
        BulkOperation::DeleteUnredeemed => codes
            .delete_unredeemed(req.selector, admin.admin_id)
            .await?
            .len() as u64,
    };

    tracing::info!(
        admin_id = %admin.admin_id,
        operation = ?req.operation,
        affected,
        "Bulk code operation"
    );
    Ok(Json(BulkResponse { affected }))
}
