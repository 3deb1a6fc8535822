//! Request authentication
//!
//! The API sits behind a trusted gateway. The gateway authenticates end users
//! and forwards their identity in headers; this service only verifies that the
//! caller is the gateway (shared bearer secret) or the scheduler (cron secret).

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use repurpose_shared::types::UserId;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const ADMIN_ID_HEADER: &str = "x-admin-id";

/// Constant-time string comparison
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Same amount of work as a real comparison
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Require the gateway's shared secret
pub async fn require_internal(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = extract_bearer_token(request.headers())
        .map(|token| constant_time_compare(token, &state.config.internal_api_secret))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "require_internal: rejected request");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// Require the scheduler's secret. Cron routes are closed when none is configured.
pub async fn require_cron(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(secret) = state.config.cron_secret.as_deref() else {
        tracing::warn!(path = %request.uri().path(), "require_cron: CRON_SECRET not configured");
        return ApiError::ServiceUnavailable.into_response();
    };

    let authorized = extract_bearer_token(request.headers())
        .map(|token| constant_time_compare(token, secret))
        .unwrap_or(false);
    if !authorized {
        tracing::warn!(path = %request.uri().path(), "require_cron: rejected request");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

fn header_uuid(parts: &Parts, name: &str) -> Option<Uuid> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

/// End user forwarded by the gateway
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: UserId,
    pub email: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_uuid(parts, USER_ID_HEADER).ok_or(ApiError::Unauthorized)?;
        let email = parts
            .headers
            .get(USER_EMAIL_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from);

        Ok(Self {
            user_id: UserId(user_id),
            email,
        })
    }
}

/// Support staff acting through the admin console
#[derive(Debug, Clone, Copy)]
pub struct AdminUser {
    pub admin_id: UserId,
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let admin_id = header_uuid(parts, ADMIN_ID_HEADER).ok_or(ApiError::Forbidden)?;
        Ok(Self {
            admin_id: UserId(admin_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret", "secret"));
        assert!(!constant_time_compare("secret", "secreT"));
        assert!(!constant_time_compare("secret", "secret-longer"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer_token(&headers), Some("abc"));
    }
}
