//! Authentication module

pub mod middleware;

pub use middleware::{require_cron, require_internal, AdminUser, CurrentUser};
