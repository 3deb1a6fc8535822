//! Entitlement invariants
//!
//! Read-only reconciliation queries over plans, codes and redemptions. The
//! schema already rejects most of these states; the checks exist to catch rows
//! written around the engine (manual SQL, restores) and report them with enough
//! context to repair by hand.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CreditError, CreditResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Affected user ids or code ids
    pub subjects: Vec<String>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users can spend or redeem more than they were granted
    Critical,
    High,
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Named reconciliation checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    NonNegativeBalances,
    RedemptionsWithinLimit,
    RedemptionCountMatches,
    StackedCodesMatch,
    LtdPlanHasTier,
    NonNegativeCounters,
}

impl Invariant {
    pub const ALL: [Invariant; 6] = [
        Invariant::NonNegativeBalances,
        Invariant::RedemptionsWithinLimit,
        Invariant::RedemptionCountMatches,
        Invariant::StackedCodesMatch,
        Invariant::LtdPlanHasTier,
        Invariant::NonNegativeCounters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Invariant::NonNegativeBalances => "non_negative_balances",
            Invariant::RedemptionsWithinLimit => "redemptions_within_limit",
            Invariant::RedemptionCountMatches => "redemption_count_matches",
            Invariant::StackedCodesMatch => "stacked_codes_match",
            Invariant::LtdPlanHasTier => "ltd_plan_has_tier",
            Invariant::NonNegativeCounters => "non_negative_counters",
        }
    }
}

impl std::str::FromStr for Invariant {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Invariant::ALL
            .into_iter()
            .find(|check| check.as_str() == s)
            .ok_or_else(|| CreditError::InvalidInput(format!("Unknown invariant check: {}", s)))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    id: Uuid,
    credits: i64,
    rollover_credits: i64,
    monthly_credit_limit: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CodeCountRow {
    id: i64,
    code: String,
    current_redemptions: i32,
    max_redemptions: i32,
    recorded: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StackedCodesRow {
    id: Uuid,
    stacked_codes: i32,
    recorded: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanTierRow {
    id: Uuid,
    plan_type: String,
    ltd_tier: Option<i32>,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterRow {
    user_id: Uuid,
    month_year: String,
    feature: String,
    count: i32,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> CreditResult<InvariantCheckSummary> {
        self.run_checks(&Invariant::ALL).await
    }

    pub async fn run_checks(&self, checks: &[Invariant]) -> CreditResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        for check in checks {
            violations.extend(self.run_check(*check).await?);
        }
        Ok(InvariantCheckSummary::from_violations(
            now,
            checks.len(),
            violations,
        ))
    }

    pub async fn run_check(&self, check: Invariant) -> CreditResult<Vec<InvariantViolation>> {
        match check {
            Invariant::NonNegativeBalances => self.check_non_negative_balances().await,
            Invariant::RedemptionsWithinLimit => self.check_redemptions_within_limit().await,
            Invariant::RedemptionCountMatches => self.check_redemption_count_matches().await,
            Invariant::StackedCodesMatch => self.check_stacked_codes_match().await,
            Invariant::LtdPlanHasTier => self.check_ltd_plan_has_tier().await,
            Invariant::NonNegativeCounters => self.check_non_negative_counters().await,
        }
    }

    async fn check_non_negative_balances(&self) -> CreditResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT id, credits, rollover_credits, monthly_credit_limit
            FROM users
            WHERE credits < 0 OR rollover_credits < 0 OR monthly_credit_limit < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: Invariant::NonNegativeBalances.as_str().to_string(),
                subjects: vec![row.id.to_string()],
                description: format!("User has a negative balance field ({} credits)", row.credits),
                context: serde_json::json!({
                    "credits": row.credits,
                    "rollover_credits": row.rollover_credits,
                    "monthly_credit_limit": row.monthly_credit_limit,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_redemptions_within_limit(&self) -> CreditResult<Vec<InvariantViolation>> {
        let rows: Vec<CodeCountRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.code, c.current_redemptions, c.max_redemptions,
                   (SELECT COUNT(*) FROM ltd_redemptions r WHERE r.code_id = c.id) AS recorded
            FROM ltd_codes c
            WHERE c.current_redemptions > c.max_redemptions OR c.current_redemptions < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: Invariant::RedemptionsWithinLimit.as_str().to_string(),
                subjects: vec![row.id.to_string()],
                description: format!(
                    "Code {} redeemed {} times (max {})",
                    row.code, row.current_redemptions, row.max_redemptions
                ),
                context: serde_json::json!({
                    "current_redemptions": row.current_redemptions,
                    "max_redemptions": row.max_redemptions,
                    "recorded": row.recorded,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_redemption_count_matches(&self) -> CreditResult<Vec<InvariantViolation>> {
        let rows: Vec<CodeCountRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.code, c.current_redemptions, c.max_redemptions,
                   COUNT(r.id) AS recorded
            FROM ltd_codes c
            LEFT JOIN ltd_redemptions r ON r.code_id = c.id
            GROUP BY c.id
            HAVING c.current_redemptions <> COUNT(r.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: Invariant::RedemptionCountMatches.as_str().to_string(),
                subjects: vec![row.id.to_string()],
                description: format!(
                    "Code {} counter says {} redemptions but {} are recorded",
                    row.code, row.current_redemptions, row.recorded
                ),
                context: serde_json::json!({
                    "current_redemptions": row.current_redemptions,
                    "recorded": row.recorded,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_stacked_codes_match(&self) -> CreditResult<Vec<InvariantViolation>> {
        let rows: Vec<StackedCodesRow> = sqlx::query_as(
            r#"
            SELECT u.id, u.stacked_codes, COUNT(r.id) AS recorded
            FROM users u
            LEFT JOIN ltd_redemptions r ON r.user_id = u.id
            GROUP BY u.id
            HAVING u.stacked_codes <> COUNT(r.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: Invariant::StackedCodesMatch.as_str().to_string(),
                subjects: vec![row.id.to_string()],
                description: format!(
                    "User has stacked_codes = {} but {} redemptions",
                    row.stacked_codes, row.recorded
                ),
                context: serde_json::json!({
                    "stacked_codes": row.stacked_codes,
                    "recorded": row.recorded,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_ltd_plan_has_tier(&self) -> CreditResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanTierRow> = sqlx::query_as(
            r#"
            SELECT id, plan_type, ltd_tier
            FROM users
            WHERE (plan_type = 'ltd') <> (ltd_tier IS NOT NULL)
               OR ltd_tier NOT BETWEEN 1 AND 5
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: Invariant::LtdPlanHasTier.as_str().to_string(),
                subjects: vec![row.id.to_string()],
                description: format!(
                    "Plan {} has tier {:?}",
                    row.plan_type, row.ltd_tier
                ),
                context: serde_json::json!({
                    "plan_type": row.plan_type,
                    "ltd_tier": row.ltd_tier,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_non_negative_counters(&self) -> CreditResult<Vec<InvariantViolation>> {
        let rows: Vec<CounterRow> = sqlx::query_as(
            r#"
            SELECT user_id, month_year::text AS month_year, 'scheduling' AS feature,
                   scheduled_count AS count
            FROM user_monthly_scheduling_usage WHERE scheduled_count < 0
            UNION ALL
            SELECT user_id, month_year::text, 'chat', message_count
            FROM user_monthly_chat_usage WHERE message_count < 0
            UNION ALL
            SELECT user_id, month_year::text, 'api_calls', api_calls
            FROM user_monthly_api_usage WHERE api_calls < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: Invariant::NonNegativeCounters.as_str().to_string(),
                subjects: vec![row.user_id.to_string()],
                description: format!(
                    "{} counter for {} is {}",
                    row.feature, row.month_year, row.count
                ),
                context: serde_json::json!({
                    "feature": row.feature,
                    "month_year": row.month_year,
                    "count": row.count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
