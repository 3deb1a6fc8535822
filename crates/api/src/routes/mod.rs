//! API routes

pub mod admin;
pub mod credits;
pub mod cron;
pub mod health;
pub mod plan;

use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use repurpose_credits::{RejectionReason, UserPlan};

use crate::{
    auth::{require_cron, require_internal, CurrentUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

/// HTTP status for a business rejection. The body still carries the outcome.
pub fn rejection_status(reason: RejectionReason) -> StatusCode {
    match reason {
        RejectionReason::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
        RejectionReason::CodeInvalid => StatusCode::BAD_REQUEST,
        RejectionReason::AlreadyRedeemed | RejectionReason::ConcurrentExhaustion => {
            StatusCode::CONFLICT
        }
        RejectionReason::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        RejectionReason::TierRestricted => StatusCode::FORBIDDEN,
        RejectionReason::UserNotFound => StatusCode::NOT_FOUND,
    }
}

/// The caller's plan, creating a free plan row on first sight when the gateway
/// forwarded an email
pub(crate) async fn ensure_plan(state: &AppState, user: &CurrentUser) -> ApiResult<UserPlan> {
    if let Some(plan) = state.engine.gate.get_user_plan(user.user_id).await? {
        return Ok(plan);
    }
    let Some(email) = user.email.as_deref() else {
        return Err(ApiError::NotFound(format!("user {}", user.user_id)));
    };
    let starting_credits = state.engine.tiers.free.monthly_credits;
    Ok(state
        .engine
        .plans
        .ensure_user(user.user_id, email, starting_credits)
        .await?)
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // End-user routes; identity comes from gateway headers
    let user_routes = Router::new()
        .route("/plan", get(plan::get_plan))
        .route("/redeem", post(plan::redeem))
        .route("/redeem/validate", get(plan::validate_code))
        .route("/features/:feature", get(plan::check_feature))
        .route("/usage/:feature", get(plan::usage))
        .route("/credits/check", get(credits::check))
        .route("/credits/deduct", post(credits::deduct))
        .route("/credits/history", get(credits::history))
        .route("/credits/analytics", get(credits::analytics));

    let api_routes = Router::new()
        .merge(user_routes)
        .nest("/admin", admin::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal,
        ));

    let cron_routes = Router::new()
        .route("/expire-codes", post(cron::expire_codes))
        .route("/credit-refresh", post(cron::credit_refresh))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_cron));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .nest("/cron", cron_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use repurpose_credits::TierTable;
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    use crate::config::Config;

    const SECRET: &str = "test-internal-secret-at-least-32-characters";

    fn test_state(cron_secret: Option<&str>) -> AppState {
        // Lazy pool: these requests are rejected before touching the database
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let config = Config {
            bind_address: "127.0.0.1:0".into(),
            database_url: "postgres://localhost/unused".into(),
            database_max_connections: 1,
            run_migrations: false,
            lock_timeout_ms: 500,
            internal_api_secret: SECRET.into(),
            cron_secret: cron_secret.map(String::from),
            tier_config_path: None,
        };
        AppState::new(pool, config, TierTable::default())
    }

    #[test]
    fn test_rejection_status() {
        assert_eq!(
            rejection_status(RejectionReason::InsufficientCredits),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            rejection_status(RejectionReason::ConcurrentExhaustion),
            StatusCode::CONFLICT
        );
        assert_eq!(
            rejection_status(RejectionReason::TierRestricted),
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_liveness_needs_no_auth() {
        let app = create_router(test_state(None));
        let response = app
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_internal_secret() {
        let app = create_router(test_state(None));
        let response = app
            .oneshot(
                Request::get("/api/v1/plan")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_user_routes_require_identity() {
        let app = create_router(test_state(None));
        let response = app
            .oneshot(
                Request::get("/api/v1/plan")
                    .header("authorization", format!("Bearer {}", SECRET))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_routes_require_admin_header() {
        let app = create_router(test_state(None));
        let response = app
            .oneshot(
                Request::get("/api/v1/admin/codes/statistics")
                    .header("authorization", format!("Bearer {}", SECRET))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_cron_closed_without_secret() {
        let app = create_router(test_state(None));
        let response = app
            .oneshot(
                Request::post("/cron/expire-codes")
                    .header("authorization", format!("Bearer {}", SECRET))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cron_rejects_internal_secret() {
        let app = create_router(test_state(Some("cron-secret-that-is-at-least-32-chars!")));
        let response = app
            .oneshot(
                Request::post("/cron/credit-refresh")
                    .header("authorization", format!("Bearer {}", SECRET))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
