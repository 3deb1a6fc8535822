//! Admin Audit Log
//!
//! Append-only record of every privileged mutation. Failed attempts are recorded
//! too, with `"outcome": "failed"`, so abuse is visible after the fact.

use repurpose_shared::types::UserId;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CreditError, CreditResult};

/// Admin action types
pub mod action {
    /// Batch code generation
    pub const GENERATE_CODES: &str = "generate_codes";
    pub const UPDATE_CODE: &str = "update_code";
    /// Single code deletion (unredeemed only)
    pub const DELETE_CODE: &str = "delete_code";
    pub const BULK_ACTIVATE: &str = "bulk_activate";
    pub const BULK_DEACTIVATE: &str = "bulk_deactivate";
    pub const BULK_DELETE_UNREDEEMED: &str = "bulk_delete_unredeemed";
    /// Manual credit grant
    pub const GRANT_CREDITS: &str = "grant_credits";
    /// Balance overwrite
    pub const SET_CREDITS: &str = "set_credits";
    /// Tier or monthly limit change
    pub const CHANGE_PLAN: &str = "change_plan";
    pub const EXPORT_CODES: &str = "export_codes";
    pub const EXPORT_USERS: &str = "export_users";
}

/// Outcome values stored in `details.outcome`
pub mod outcome {
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
}

/// A privileged action about to be recorded
#[derive(Debug, Clone)]
pub struct AdminAction {
    pub admin_id: UserId,
    pub action_type: &'static str,
    pub target_id: Option<String>,
    pub details: serde_json::Value,
}

impl AdminAction {
    pub fn new(admin_id: UserId, action_type: &'static str) -> Self {
        Self {
            admin_id,
            action_type,
            target_id: None,
            details: serde_json::json!({}),
        }
    }

    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Details merged with the attempt outcome
    fn with_outcome(&self, error: Option<&CreditError>) -> serde_json::Value {
        let mut details = match &self.details {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other.clone());
                map
            }
        };
        match error {
            None => {
                details.insert("outcome".into(), outcome::SUCCESS.into());
            }
            Some(err) => {
                details.insert("outcome".into(), outcome::FAILED.into());
                details.insert("error".into(), err.to_string().into());
            }
        }
        serde_json::Value::Object(details)
    }
}

/// Stored admin action
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminActionRecord {
    pub id: i64,
    pub admin_user_id: Uuid,
    pub action_type: String,
    pub target_id: Option<String>,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Filter for listing admin actions
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminActionFilter {
    pub action_type: Option<String>,
    pub admin_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Clone)]
pub struct AdminAuditLog {
    pool: PgPool,
}

impl AdminAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record an attempt and hand its result back unchanged.
    ///
    /// A failure to write the audit row is logged but never masks the result.
    pub async fn record_attempt<T>(
        &self,
        action: AdminAction,
        result: CreditResult<T>,
    ) -> CreditResult<T> {
        let details = action.with_outcome(result.as_ref().err());
        let write = sqlx::query(
            r#"
            INSERT INTO admin_ltd_actions (admin_user_id, action_type, target_id, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(action.admin_id.0)
        .bind(action.action_type)
        .bind(&action.target_id)
        .bind(&details)
        .execute(&self.pool)
        .await;

        if let Err(e) = write {
            tracing::error!(
                admin_id = %action.admin_id,
                action_type = action.action_type,
                error = %e,
                "Failed to write admin audit record"
            );
        }

        match &result {
            Ok(_) => tracing::info!(
                admin_id = %action.admin_id,
                action_type = action.action_type,
                target_id = ?action.target_id,
                "Admin action completed"
            ),
            Err(err) => tracing::warn!(
                admin_id = %action.admin_id,
                action_type = action.action_type,
                target_id = ?action.target_id,
                error = %err,
                "Admin action failed"
            ),
        }

        result
    }

    /// Record a successful action inside the mutation's own transaction
    pub async fn record_in(conn: &mut PgConnection, action: &AdminAction) -> CreditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_ltd_actions (admin_user_id, action_type, target_id, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(action.admin_id.0)
        .bind(action.action_type)
        .bind(&action.target_id)
        .bind(action.with_outcome(None))
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn list(&self, filter: &AdminActionFilter) -> CreditResult<Vec<AdminActionRecord>> {
        let limit = filter.limit.unwrap_or(100).clamp(1, 500);
        let offset = filter.offset.unwrap_or(0).max(0);

        let records: Vec<AdminActionRecord> = sqlx::query_as(
            r#"
            SELECT id, admin_user_id, action_type, target_id, details, created_at
            FROM admin_ltd_actions
            WHERE ($3::text IS NULL OR action_type = $3)
              AND ($4::uuid IS NULL OR admin_user_id = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .bind(&filter.action_type)
        .bind(filter.admin_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
