#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Repurpose API Library
//!
//! HTTP surface of the credit engine: end-user plan and credit routes,
//! admin console routes and scheduler hooks.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
