//! LTD user administration
//!
//! Read views over LTD customers and the privileged plan mutations support
//! staff need. Every mutation is audited, successful or not.

use std::sync::Arc;

use repurpose_shared::types::{add_months, LtdTier, PlanType, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{action, AdminAction, AdminActionFilter, AdminActionRecord, AdminAuditLog};
use crate::error::{CreditError, CreditResult};
use crate::ledger::{CreditLedger, CreditUsageEntry};
use crate::plan::{PlanSnapshot, PlanStore, UserPlan};
use crate::redemption::{RedemptionProcessor, RedemptionRecord};
use crate::tiers::TierTable;

/// LTD customer row for admin listings
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LtdUserSummary {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub ltd_tier: Option<i32>,
    pub credits: i64,
    pub monthly_credit_limit: i64,
    pub stacked_codes: i32,
    pub redemption_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserFilter {
    pub search: Option<String>,
    pub tier: Option<i32>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPage {
    pub users: Vec<LtdUserSummary>,
    pub total: i64,
    pub page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LtdUserDetail {
    pub email: String,
    pub plan: PlanSnapshot,
    pub redemptions: Vec<RedemptionRecord>,
    pub recent_usage: Vec<CreditUsageEntry>,
}

/// Admin plan change. At least one field must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanChange {
    pub tier: Option<u8>,
    pub monthly_credit_limit: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Apply `change` to `plan`.
///
/// Moving a non-LTD plan onto a tier without an explicit limit starts the
/// limit at that tier's allotment. Balances are untouched.
pub fn apply_plan_change(
    plan: &UserPlan,
    change: &PlanChange,
    tiers: &TierTable,
    now: OffsetDateTime,
) -> CreditResult<UserPlan> {
    if change.tier.is_none() && change.monthly_credit_limit.is_none() {
        return Err(CreditError::InvalidInput(
            "a tier or monthly credit limit is required".into(),
        ));
    }
    if let Some(limit) = change.monthly_credit_limit {
        if limit < 0 {
            return Err(CreditError::InvalidInput(
                "monthly credit limit must be non-negative".into(),
            ));
        }
    }

    let mut next = plan.clone();
    if let Some(tier) = change.tier {
        let tier = LtdTier::try_from(tier)?;
        if plan.plan_type != PlanType::Ltd && change.monthly_credit_limit.is_none() {
            next.monthly_credit_limit = tiers.monthly_credits(tier)?;
        }
        next.plan_type = PlanType::Ltd;
        next.ltd_tier = Some(tier);
    } else if plan.plan_type != PlanType::Ltd {
        return Err(CreditError::InvalidInput(
            "monthly credit limit can only be changed on LTD plans".into(),
        ));
    }
    if let Some(limit) = change.monthly_credit_limit {
        next.monthly_credit_limit = limit;
    }
    if next.credit_reset_date.is_none() {
        next.credit_reset_date = Some(add_months(now, 1)?);
    }
    Ok(next)
}

fn page_bounds(page: Option<i64>, limit: Option<i64>) -> CreditResult<(i64, i64)> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(50);
    if page < 1 {
        return Err(CreditError::InvalidInput("page must be at least 1".into()));
    }
    if !(1..=500).contains(&limit) {
        return Err(CreditError::InvalidInput(
            "limit must be between 1 and 500".into(),
        ));
    }
    Ok((page, limit))
}

#[derive(Clone)]
pub struct AdminService {
    pool: PgPool,
    plans: PlanStore,
    ledger: CreditLedger,
    redemptions: RedemptionProcessor,
    audit: AdminAuditLog,
    tiers: Arc<TierTable>,
}

impl AdminService {
    pub fn new(
        plans: PlanStore,
        ledger: CreditLedger,
        redemptions: RedemptionProcessor,
        audit: AdminAuditLog,
        tiers: Arc<TierTable>,
    ) -> Self {
        Self {
            pool: plans.pool().clone(),
            plans,
            ledger,
            redemptions,
            audit,
            tiers,
        }
    }

    pub async fn list_ltd_users(&self, filter: &UserFilter) -> CreditResult<UserPage> {
        let (page, limit) = page_bounds(filter.page, filter.limit)?;
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM users
            WHERE plan_type = 'ltd'
              AND ($1::int IS NULL OR ltd_tier = $1)
              AND ($2::text IS NULL OR email ILIKE $2 OR name ILIKE $2)
            "#,
        )
        .bind(filter.tier)
        .bind(&search)
        .fetch_one(&self.pool)
        .await?;

        let users: Vec<LtdUserSummary> = sqlx::query_as(
            r#"
            SELECT
                u.id, u.email, u.name, u.ltd_tier, u.credits, u.monthly_credit_limit,
                u.stacked_codes, u.created_at,
                (SELECT COUNT(*) FROM ltd_redemptions r WHERE r.user_id = u.id) AS redemption_count
            FROM users u
            WHERE u.plan_type = 'ltd'
              AND ($1::int IS NULL OR u.ltd_tier = $1)
              AND ($2::text IS NULL OR u.email ILIKE $2 OR u.name ILIKE $2)
            ORDER BY u.created_at DESC, u.id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.tier)
        .bind(&search)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(UserPage {
            users,
            total,
            page,
            total_pages: (total + limit - 1) / limit,
        })
    }

    /// Every LTD user matching `filter` (CSV export)
    pub async fn all_ltd_users(&self, filter: &UserFilter) -> CreditResult<Vec<LtdUserSummary>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .list_ltd_users(&UserFilter {
                    page: Some(page),
                    limit: Some(500),
                    ..filter.clone()
                })
                .await?;
            let done = page >= batch.total_pages;
            all.extend(batch.users);
            if done {
                return Ok(all);
            }
            page += 1;
        }
    }

    pub async fn user_detail(&self, user_id: UserId) -> CreditResult<LtdUserDetail> {
        let plan = self
            .plans
            .get(user_id)
            .await?
            .ok_or_else(|| CreditError::NotFound(format!("user {}", user_id)))?;
        let redemptions = self.redemptions.user_redemptions(user_id).await?;
        let recent_usage = self.ledger.usage_history(user_id, 50).await?;

        Ok(LtdUserDetail {
            email: plan.email.clone(),
            plan: plan.snapshot(),
            redemptions,
            recent_usage,
        })
    }

    /// Change a user's tier and/or monthly limit. Audited.
    pub async fn change_plan(
        &self,
        user_id: UserId,
        change: PlanChange,
        admin_id: UserId,
    ) -> CreditResult<PlanSnapshot> {
        let audit = AdminAction::new(admin_id, action::CHANGE_PLAN)
            .target(user_id.to_string())
            .details(serde_json::json!({
                "tier": change.tier,
                "monthly_credit_limit": change.monthly_credit_limit,
                "reason": change.reason,
            }));

        let result: CreditResult<PlanSnapshot> = async {
            let mut tx = self.plans.begin().await?;
            let plan = tx
                .lock_user(user_id)
                .await?
                .ok_or_else(|| CreditError::NotFound(format!("user {}", user_id)))?;
            let next = apply_plan_change(&plan, &change, &self.tiers, OffsetDateTime::now_utc())?;
            tx.store(&next).await?;
            tx.commit().await?;

            tracing::info!(
                user_id = %user_id,
                admin_id = %admin_id,
                previous_tier = ?plan.ltd_tier.map(u8::from),
                tier = ?next.ltd_tier.map(u8::from),
                monthly_limit = next.monthly_credit_limit,
                "Plan changed by admin"
            );
            Ok(next.snapshot())
        }
        .await;

        self.audit.record_attempt(audit, result).await
    }

    /// Manual grant through the ledger. Audited. Returns the new balance.
    pub async fn grant_credits(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        admin_id: UserId,
    ) -> CreditResult<i64> {
        let audit = AdminAction::new(admin_id, action::GRANT_CREDITS)
            .target(user_id.to_string())
            .details(serde_json::json!({ "amount": amount, "reason": reason }));

        let result = if amount < 1 {
            Err(CreditError::InvalidInput(
                "amount must be at least 1".into(),
            ))
        } else {
            self.ledger.add(user_id, amount, reason).await
        };
        self.audit.record_attempt(audit, result).await
    }

    /// Overwrite a balance. Audited. Returns the new balance.
    pub async fn set_credits(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
        admin_id: UserId,
    ) -> CreditResult<i64> {
        let audit = AdminAction::new(admin_id, action::SET_CREDITS)
            .target(user_id.to_string())
            .details(serde_json::json!({ "amount": amount, "reason": reason }));

        let result = self.ledger.set_balance(user_id, amount, reason).await;
        self.audit.record_attempt(audit, result).await
    }

    pub async fn list_actions(
        &self,
        filter: &AdminActionFilter,
    ) -> CreditResult<Vec<AdminActionRecord>> {
        self.audit.list(filter).await
    }

    /// Audit an export; the rows themselves are produced by [`crate::export`]
    pub async fn record_export(
        &self,
        admin_id: UserId,
        action_type: &'static str,
        rows: usize,
    ) -> CreditResult<()> {
        let audit = AdminAction::new(admin_id, action_type)
            .details(serde_json::json!({ "rows": rows }));
        self.audit.record_attempt(audit, Ok(())).await
    }
}
