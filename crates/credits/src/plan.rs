//! Plan Mutation boundary
//!
//! Every write to a user's plan row (ledger deductions and grants, monthly
//! resets, redemptions, admin plan changes) goes through a [`PlanTx`]: one
//! transaction with a short `lock_timeout`, the user row locked `FOR UPDATE`
//! first, then any code row. Keeping one lock order here is what keeps the
//! ledger and the redemption processor from deadlocking each other.

use repurpose_shared::types::{add_months, LtdTier, PlanType, UserId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CreditError, CreditResult};

/// Default lock wait for plan mutations
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;

const USER_PLAN_COLUMNS: &str = "id, email, plan_type, ltd_tier, credits, monthly_credit_limit, \
     rollover_credits, credit_reset_date, stacked_codes";

/// Raw `users` row as stored
#[derive(Debug, Clone, sqlx::FromRow)]
struct UserPlanRow {
    id: Uuid,
    email: String,
    plan_type: String,
    ltd_tier: Option<i32>,
    credits: i64,
    monthly_credit_limit: i64,
    rollover_credits: i64,
    credit_reset_date: Option<OffsetDateTime>,
    stacked_codes: i32,
}

/// A user's plan and balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPlan {
    pub user_id: UserId,
    pub email: String,
    pub plan_type: PlanType,
    pub ltd_tier: Option<LtdTier>,
    pub credits: i64,
    pub monthly_credit_limit: i64,
    pub rollover_credits: i64,
    pub credit_reset_date: Option<OffsetDateTime>,
    pub stacked_codes: i32,
}

impl TryFrom<UserPlanRow> for UserPlan {
    type Error = CreditError;

    fn try_from(row: UserPlanRow) -> Result<Self, Self::Error> {
        let plan_type: PlanType = row.plan_type.parse()?;
        let ltd_tier = row.ltd_tier.map(LtdTier::try_from).transpose()?;
        if plan_type == PlanType::Ltd && ltd_tier.is_none() {
            return Err(CreditError::IntegrityViolation(format!(
                "user {} is on an LTD plan without a tier",
                row.id
            )));
        }

        Ok(Self {
            user_id: UserId(row.id),
            email: row.email,
            plan_type,
            ltd_tier,
            credits: row.credits,
            monthly_credit_limit: row.monthly_credit_limit,
            rollover_credits: row.rollover_credits,
            credit_reset_date: row.credit_reset_date,
            stacked_codes: row.stacked_codes,
        })
    }
}

impl UserPlan {
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            user_id: self.user_id,
            plan_type: self.plan_type,
            tier: self.ltd_tier,
            credits: self.credits,
            monthly_limit: self.monthly_credit_limit,
            rollover: self.rollover_credits,
            reset_date: self.credit_reset_date,
            stacked_codes: self.stacked_codes,
        }
    }
}

/// Plan/balance view exposed to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub tier: Option<LtdTier>,
    pub credits: i64,
    pub monthly_limit: i64,
    pub rollover: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reset_date: Option<OffsetDateTime>,
    pub stacked_codes: i32,
}

/// Entry point for reading and mutating plan rows
#[derive(Clone)]
pub struct PlanStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PlanStore {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a plan mutation transaction
    pub async fn begin(&self) -> CreditResult<PlanTx> {
        let mut tx = self.pool.begin().await?;

        // Row scope is one user and at most one code; fail fast instead of queueing
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms);
        sqlx::query(&statement).execute(&mut *tx).await?;

        Ok(PlanTx { tx })
    }

    /// Unlocked read
    pub async fn get(&self, user_id: UserId) -> CreditResult<Option<UserPlan>> {
        let row: Option<UserPlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_PLAN_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserPlan::try_from).transpose()
    }

    /// Create the plan row for a newly seen identity: free plan, first cycle
    /// starting now
    pub async fn ensure_user(
        &self,
        user_id: UserId,
        email: &str,
        starting_credits: i64,
    ) -> CreditResult<UserPlan> {
        let next_reset = add_months(OffsetDateTime::now_utc(), 1)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO users
                (id, email, plan_type, credits, monthly_credit_limit, credit_reset_date)
            VALUES ($1, $2, 'free', $3, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user_id.0)
        .bind(email)
        .bind(starting_credits)
        .bind(next_reset)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            tracing::info!(user_id = %user_id, "Created plan row for new user");
        }

        self.get(user_id).await?.ok_or_else(|| CreditError::NotFound(format!("user {}", user_id)))
    }
}

/// An open plan mutation. Dropping it without [`PlanTx::commit`] rolls back.
pub struct PlanTx {
    tx: Transaction<'static, Postgres>,
}

impl PlanTx {
    /// Lock the user row. Always the first lock taken in a plan mutation.
    pub async fn lock_user(&mut self, user_id: UserId) -> CreditResult<Option<UserPlan>> {
        let row: Option<UserPlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            USER_PLAN_COLUMNS
        ))
        .bind(user_id.0)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(UserPlan::try_from).transpose()
    }

    /// Persist the mutable plan fields of `plan`
    pub async fn store(&mut self, plan: &UserPlan) -> CreditResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE users SET
                plan_type = $2,
                ltd_tier = $3,
                credits = $4,
                monthly_credit_limit = $5,
                rollover_credits = $6,
                credit_reset_date = $7,
                stacked_codes = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(plan.user_id.0)
        .bind(plan.plan_type.as_str())
        .bind(plan.ltd_tier.map(i32::from))
        .bind(plan.credits)
        .bind(plan.monthly_credit_limit)
        .bind(plan.rollover_credits)
        .bind(plan.credit_reset_date)
        .bind(plan.stacked_codes)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(CreditError::NotFound(format!("user {}", plan.user_id)));
        }
        Ok(())
    }

    /// Connection for statements that must join this transaction
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> CreditResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
