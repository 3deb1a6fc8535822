//! Admin console routes
//!
//! - `codes`: code generation, listing, editing, bulk operations and CSV export
//! - `users`: LTD customer listing, plan changes and manual credit adjustments
//! - `shared`: CSV responses and the audit/invariant endpoints
//!
//! Every handler takes an [`AdminUser`](crate::auth::AdminUser); the gateway
//! only forwards `x-admin-id` for staff sessions.

pub mod codes;
pub mod shared;
pub mod users;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        // Codes
        .route("/codes", post(codes::generate).get(codes::list))
        .route("/codes/statistics", get(codes::statistics))
        .route("/codes/expiring", get(codes::expiring))
        .route("/codes/export", get(codes::export))
        .route("/codes/bulk", post(codes::bulk))
        .route(
            "/codes/:id",
            get(codes::get_code).patch(codes::update).delete(codes::delete),
        )
        // Users
        .route("/users", get(users::list))
        .route("/users/export", get(users::export))
        .route("/users/:id", get(users::detail))
        .route("/users/:id/plan", patch(users::change_plan))
        .route(
            "/users/:id/credits",
            post(users::grant_credits).put(users::set_credits),
        )
        // Oversight
        .route("/actions", get(shared::list_actions))
        .route("/invariants", get(shared::run_invariants))
}
