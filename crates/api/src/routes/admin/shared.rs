//! Shared helpers and oversight endpoints for admin routes

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use repurpose_credits::{AdminActionFilter, AdminActionRecord, Invariant, InvariantCheckSummary};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};

use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// `{prefix}-{yyyy-mm-dd}.csv`
pub fn export_filename(prefix: &str, now: OffsetDateTime) -> String {
    let date = now
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| "export".to_string());
    format!("{}-{}.csv", prefix, date)
}

/// CSV body served as a download
pub fn csv_response(filename: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct ActionListResponse {
    pub actions: Vec<AdminActionRecord>,
}

pub async fn list_actions(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(filter): Query<AdminActionFilter>,
) -> ApiResult<Json<ActionListResponse>> {
    let actions = state.engine.admin.list_actions(&filter).await?;
    Ok(Json(ActionListResponse { actions }))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Comma-separated check names; all checks when absent
    pub checks: Option<String>,
}

fn parse_checks(raw: Option<&str>) -> ApiResult<Vec<Invariant>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(Invariant::ALL.to_vec()),
        Some(raw) => raw
            .split(',')
            .map(|name| name.trim().parse::<Invariant>().map_err(ApiError::from))
            .collect(),
    }
}

/// Run reconciliation checks on demand
pub async fn run_invariants(
    State(state): State<AppState>,
    admin: AdminUser,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checks = parse_checks(query.checks.as_deref())?;
    let summary = state.engine.invariant_checker().run_checks(&checks).await?;

    if !summary.healthy {
        tracing::warn!(
            admin_id = %admin.admin_id,
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }
    Ok(Json(summary))
}
