//! Scheduled maintenance endpoints, called by an external scheduler

use axum::{extract::State, Json};
use repurpose_credits::ResetSweep;
use serde::Serialize;

use crate::{error::ApiResult, state::AppState};

/// Plans refreshed per call; the scheduler calls again until `examined` is short
const RESET_BATCH_SIZE: i64 = 1000;

#[derive(Debug, Serialize)]
pub struct ExpireCodesResponse {
    pub deactivated: usize,
}

/// Deactivate codes whose expiry has passed
pub async fn expire_codes(State(state): State<AppState>) -> ApiResult<Json<ExpireCodesResponse>> {
    let expired = state.engine.codes.sweep_expired().await?;
    tracing::info!(deactivated = expired.len(), "cron: expire-codes finished");
    Ok(Json(ExpireCodesResponse {
        deactivated: expired.len(),
    }))
}

/// Apply every overdue monthly credit reset
pub async fn credit_refresh(State(state): State<AppState>) -> ApiResult<Json<ResetSweep>> {
    let sweep = state.engine.ledger.reset_all_due(RESET_BATCH_SIZE).await?;
    tracing::info!(
        examined = sweep.examined,
        reset = sweep.reset,
        failed = sweep.failed,
        "cron: credit-refresh finished"
    );
    Ok(Json(sweep))
}
