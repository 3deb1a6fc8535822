//! Tier-Usage Counters
//!
//! Durable per-(user, feature, month) counters enforcing hard monthly caps that
//! credits cannot buy past. Counters live in the same store as the ledger and
//! are upserted atomically; nothing is kept in process memory.

use std::sync::Arc;

use repurpose_shared::types::{month_year, LtdTier, UserId};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{CreditError, CreditResult};
use crate::outcome::RejectionReason;
use crate::tiers::{CounterFeature, Limit, TierTable};

/// Limit decision for one counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub allowed: bool,
    pub current: i64,
    pub limit: Limit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    pub month_year: String,
}

/// Decide whether `requested` more units fit under `limit`
pub fn decide_limit(current: i64, limit: Limit, requested: i64, month: String) -> LimitCheck {
    let reason = if !limit.is_enabled() {
        Some(RejectionReason::TierRestricted)
    } else if !limit.allows(current, requested) {
        Some(RejectionReason::LimitExceeded)
    } else {
        None
    };

    LimitCheck {
        allowed: reason.is_none(),
        current,
        limit,
        reason,
        month_year: month,
    }
}

/// Backing table and count column
fn storage(counter: CounterFeature) -> (&'static str, &'static str) {
    match counter {
        CounterFeature::Scheduling => ("user_monthly_scheduling_usage", "scheduled_count"),
        CounterFeature::Chat => ("user_monthly_chat_usage", "message_count"),
        CounterFeature::ApiCalls => ("user_monthly_api_usage", "api_calls"),
    }
}

fn validate_units(units: i32) -> CreditResult<()> {
    if units < 1 {
        return Err(CreditError::InvalidInput("units must be at least 1".into()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct UsageCounters {
    pool: PgPool,
    tiers: Arc<TierTable>,
}

impl UsageCounters {
    pub fn new(pool: PgPool, tiers: Arc<TierTable>) -> Self {
        Self { pool, tiers }
    }

    /// This month's count
    pub async fn current(&self, user_id: UserId, counter: CounterFeature) -> CreditResult<i64> {
        self.count_for(user_id, counter, &month_year(OffsetDateTime::now_utc())).await
    }

    async fn count_for(
        &self,
        user_id: UserId,
        counter: CounterFeature,
        month: &str,
    ) -> CreditResult<i64> {
        let (table, column) = storage(counter);
        let count: Option<i32> = sqlx::query_scalar(&format!(
            "SELECT {} FROM {} WHERE user_id = $1 AND month_year = $2",
            column, table
        ))
        .bind(user_id.0)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(i64::from).unwrap_or(0))
    }

    /// Read-only check against an LTD tier's cap
    pub async fn check_limit(
        &self,
        user_id: UserId,
        counter: CounterFeature,
        tier: LtdTier,
    ) -> CreditResult<LimitCheck> {
        let limit = self.tiers.tier(tier)?.features.counter_limit(counter);
        self.check_against(user_id, counter, limit).await
    }

    /// Read-only check against an explicit cap
    pub async fn check_against(
        &self,
        user_id: UserId,
        counter: CounterFeature,
        limit: Limit,
    ) -> CreditResult<LimitCheck> {
        let month = month_year(OffsetDateTime::now_utc());
        let current = self.count_for(user_id, counter, &month).await?;
        Ok(decide_limit(current, limit, 1, month))
    }

    /// Bump the counter after the gated action succeeded. Returns the new count.
    pub async fn increment(
        &self,
        user_id: UserId,
        counter: CounterFeature,
        units: i32,
    ) -> CreditResult<i64> {
        validate_units(units)?;
        let (table, column) = storage(counter);
        let month = month_year(OffsetDateTime::now_utc());

        let count: i32 = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {table} (user_id, month_year, {column})
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, month_year) DO UPDATE
            SET {column} = {table}.{column} + EXCLUDED.{column}, updated_at = NOW()
            RETURNING {column}
            "#,
        ))
        .bind(user_id.0)
        .bind(&month)
        .bind(units)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            user_id = %user_id,
            counter = %counter,
            count,
            month = %month,
            "Usage counter incremented"
        );
        Ok(i64::from(count))
    }

    /// Check and increment in one guarded upsert; the counter never passes the cap
    pub async fn try_consume(
        &self,
        user_id: UserId,
        counter: CounterFeature,
        limit: Limit,
        units: i32,
    ) -> CreditResult<LimitCheck> {
        validate_units(units)?;
        let month = month_year(OffsetDateTime::now_utc());
        if !limit.is_enabled() {
            let current = self.count_for(user_id, counter, &month).await?;
            return Ok(decide_limit(current, limit, i64::from(units), month));
        }

        let (table, column) = storage(counter);
        let cap: Option<i64> = limit.cap().map(i64::from);
        let consumed: Option<i32> = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {table} (user_id, month_year, {column})
            SELECT $1, $2, $3
            WHERE $4::bigint IS NULL OR $3 <= $4
            ON CONFLICT (user_id, month_year) DO UPDATE
            SET {column} = {table}.{column} + EXCLUDED.{column}, updated_at = NOW()
            WHERE $4::bigint IS NULL OR {table}.{column} + EXCLUDED.{column} <= $4
            RETURNING {column}
            "#,
        ))
        .bind(user_id.0)
        .bind(&month)
        .bind(units)
        .bind(cap)
        .fetch_optional(&self.pool)
        .await?;

        match consumed {
            Some(count) => Ok(LimitCheck {
                allowed: true,
                current: i64::from(count),
                limit,
                reason: None,
                month_year: month,
            }),
            None => {
                let current = self.count_for(user_id, counter, &month).await?;
                tracing::debug!(
                    user_id = %user_id,
                    counter = %counter,
                    current,
                    %limit,
                    "Usage cap reached"
                );
                Ok(LimitCheck {
                    allowed: false,
                    current,
                    limit,
                    reason: Some(RejectionReason::LimitExceeded),
                    month_year: month,
                })
            }
        }
    }

    /// Give back units consumed in `month` for an action that did not go
    /// through. Never drops the counter below zero.
    pub async fn release(
        &self,
        user_id: UserId,
        counter: CounterFeature,
        month: &str,
        units: i32,
    ) -> CreditResult<()> {
        validate_units(units)?;
        let (table, column) = storage(counter);
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET {column} = GREATEST({column} - $3, 0), updated_at = NOW()
            WHERE user_id = $1 AND month_year = $2
            "#,
        ))
        .bind(user_id.0)
        .bind(month)
        .bind(units)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            user_id = %user_id,
            counter = %counter,
            units,
            month,
            "Usage units released"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month() -> String {
        "2025-06".to_string()
    }

    #[test]
    fn test_at_cap_is_limit_exceeded() {
        let check = decide_limit(30, Limit::Capped(30), 1, month());
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(RejectionReason::LimitExceeded));
        assert_eq!(check.current, 30);
    }

    #[test]
    fn test_below_cap_is_allowed() {
        let check = decide_limit(29, Limit::Capped(30), 1, month());
        assert!(check.allowed);
        assert_eq!(check.reason, None);
    }

    #[test]
    fn test_disabled_feature_is_tier_restricted() {
        let check = decide_limit(0, Limit::Capped(0), 1, month());
        assert_eq!(check.reason, Some(RejectionReason::TierRestricted));
    }

    #[test]
    fn test_unlimited_always_allows() {
        let check = decide_limit(1_000_000, Limit::Unlimited, 50, month());
        assert!(check.allowed);
    }

    #[test]
    fn test_bulk_request_must_fit() {
        assert!(!decide_limit(25, Limit::Capped(30), 6, month()).allowed);
        assert!(decide_limit(25, Limit::Capped(30), 5, month()).allowed);
    }

    #[test]
    fn test_every_counter_has_storage() {
        for counter in CounterFeature::ALL {
            let (table, column) = storage(counter);
            assert!(table.starts_with("user_monthly_"));
            assert!(!column.is_empty());
        }
    }

    #[test]
    fn test_units_must_be_positive() {
        assert!(validate_units(0).is_err());
        assert!(validate_units(1).is_ok());
    }

    #[test]
    fn test_limit_check_serializes_unlimited() {
        let json = serde_json::to_value(decide_limit(3, Limit::Unlimited, 1, month())).unwrap();
        assert_eq!(json["limit"], "unlimited");
        assert!(json.get("reason").is_none());
    }
}
