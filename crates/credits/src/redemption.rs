//! Redemption Processor
//!
//! Converts a valid code into a plan upgrade in one plan mutation:
//! increment the code's counter, append the redemption record, raise the tier
//! and stack the tier's allotment onto the balance and the monthly limit.
//!
//! Outcomes are never retried here. Whether to try again after losing a race
//! is the user's decision.

use std::sync::Arc;

use repurpose_shared::types::{add_months, LtdTier, PlanType, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codes::{normalize_code, CodeDefect, CodeRegistry, LtdCode};
use crate::error::{CreditError, CreditResult};
use crate::ledger::{self, entry};
use crate::outcome::RejectionReason;
use crate::plan::{PlanStore, UserPlan};
use crate::tiers::TierTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RedeemOutcome {
    Redeemed {
        tier: LtdTier,
        previous_tier: Option<LtdTier>,
        credits: i64,
        credits_added: i64,
        monthly_limit: i64,
        stacked_codes: i32,
    },
    Rejected {
        reason: RejectionReason,
        message: String,
    },
}

impl RedeemOutcome {
    fn rejected(reason: RejectionReason, message: impl Into<String>) -> Self {
        RedeemOutcome::Rejected {
            reason,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RedeemOutcome::Redeemed { .. })
    }
}

/// Redemption result exposed to collaborators: `{success, tier?, credits?, error?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<LtdTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&RedeemOutcome> for RedemptionResult {
    fn from(outcome: &RedeemOutcome) -> Self {
        match outcome {
            RedeemOutcome::Redeemed { tier, credits, .. } => Self {
                success: true,
                tier: Some(*tier),
                credits: Some(*credits),
                error: None,
                message: None,
            },
            RedeemOutcome::Rejected { reason, message } => Self {
                success: false,
                tier: None,
                credits: None,
                error: Some(*reason),
                message: Some(message.clone()),
            },
        }
    }
}

/// A user's redemption history entry
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RedemptionRecord {
    pub id: i64,
    pub code_id: i64,
    pub code: String,
    pub tier: i32,
    pub previous_tier: Option<i32>,
    pub credits_added: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub redeemed_at: OffsetDateTime,
}

/// Plan after stacking one code, plus what changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub plan: UserPlan,
    pub previous_tier: Option<LtdTier>,
    pub credits_added: i64,
}

/// Stack a code of `code_tier` (granting `allotment` credits) onto `plan`.
///
/// The tier never drops. The allotment is always added to the balance. A
/// same-tier or lower-tier code also adds it to the monthly limit; an upgrade
/// or a plan converting to LTD sets the limit to the new tier's allotment,
/// keeping a larger stacked limit.
pub fn compute_grant(
    plan: &UserPlan,
    code_tier: LtdTier,
    allotment: i64,
    now: OffsetDateTime,
) -> CreditResult<Grant> {
    let was_ltd = plan.plan_type == PlanType::Ltd;
    let previous_tier = if was_ltd { plan.ltd_tier } else { None };
    let tier = previous_tier.map_or(code_tier, |current| current.max(code_tier));

    let overflow = || CreditError::InvalidInput("credit balance overflow".into());
    let credits = plan.credits.checked_add(allotment).ok_or_else(overflow)?;
    let upgraded = previous_tier.is_none_or(|current| code_tier > current);
    let monthly_credit_limit = if upgraded {
        let stacked = previous_tier.map_or(0, |_| plan.monthly_credit_limit);
        allotment.max(stacked)
    } else {
        plan.monthly_credit_limit.checked_add(allotment).ok_or_else(overflow)?
    };
    let credit_reset_date = match plan.credit_reset_date {
        Some(date) => Some(date),
        None => Some(add_months(now, 1)?),
    };

    Ok(Grant {
        plan: UserPlan {
            plan_type: PlanType::Ltd,
            ltd_tier: Some(tier),
            credits,
            monthly_credit_limit,
            credit_reset_date,
            stacked_codes: plan.stacked_codes.saturating_add(1),
            ..plan.clone()
        },
        previous_tier,
        credits_added: allotment,
    })
}

#[derive(Clone)]
pub struct RedemptionProcessor {
    plans: PlanStore,
    codes: CodeRegistry,
    tiers: Arc<TierTable>,
}

impl RedemptionProcessor {
    pub fn new(plans: PlanStore, codes: CodeRegistry, tiers: Arc<TierTable>) -> Self {
        Self {
            plans,
            codes,
            tiers,
        }
    }

    /// Redeem `raw_code` for `user_id`. All-or-nothing.
    pub async fn redeem(&self, user_id: UserId, raw_code: &str) -> CreditResult<RedeemOutcome> {
        let code = normalize_code(raw_code)?;

        // Unlocked pre-check; a code that looked usable here but is exhausted
        // under the lock lost the race for its last slot
        let Some(seen) = self.codes.find_by_code(&code).await? else {
            return Ok(RedeemOutcome::rejected(
                RejectionReason::CodeInvalid,
                CodeDefect::NotFound.message(),
            ));
        };
        let mut conn = self.plans.pool().acquire().await?;
        let redeemed_before = Self::already_redeemed(&mut conn, &seen, user_id).await?;
        drop(conn);
        if redeemed_before {
            tracing::warn!(user_id = %user_id, code = %code, "Code already redeemed by user");
            return Ok(RedeemOutcome::rejected(
                RejectionReason::AlreadyRedeemed,
                "You have already redeemed this code",
            ));
        }
        if let Some(defect) = seen.defect_at(OffsetDateTime::now_utc()) {
            tracing::debug!(user_id = %user_id, code = %code, ?defect, "Redemption rejected");
            return Ok(RedeemOutcome::rejected(
                RejectionReason::CodeInvalid,
                defect.message(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.plans.begin().await?;

        let Some(plan) = tx.lock_user(user_id).await? else {
            return Ok(RedeemOutcome::rejected(
                RejectionReason::UserNotFound,
                "User not found",
            ));
        };
        let Some(locked) = CodeRegistry::lock_code(tx.conn(), &code).await? else {
            return Ok(RedeemOutcome::rejected(
                RejectionReason::CodeInvalid,
                CodeDefect::NotFound.message(),
            ));
        };

        if Self::already_redeemed(tx.conn(), &locked, user_id).await? {
            tracing::warn!(user_id = %user_id, code = %code, "Code already redeemed by user");
            return Ok(RedeemOutcome::rejected(
                RejectionReason::AlreadyRedeemed,
                "You have already redeemed this code",
            ));
        }

        match locked.defect_at(now) {
            None => {}
            Some(CodeDefect::Exhausted) => {
                tracing::warn!(
                    user_id = %user_id,
                    code = %code,
                    "Lost race for last redemption slot"
                );
                return Ok(RedeemOutcome::rejected(
                    RejectionReason::ConcurrentExhaustion,
                    "This code was just redeemed by someone else",
                ));
            }
            Some(defect) => {
                return Ok(RedeemOutcome::rejected(
                    RejectionReason::CodeInvalid,
                    defect.message(),
                ));
            }
        }

        let code_tier = locked.ltd_tier()?;
        let allotment = self.tiers.monthly_credits(code_tier)?;
        let grant = compute_grant(&plan, code_tier, allotment, now)?;

        // Guarded increment: the CHECK constraint backs this up
        let incremented = sqlx::query(
            r#"
            UPDATE ltd_codes
            SET current_redemptions = current_redemptions + 1, updated_at = NOW()
            WHERE id = $1 AND current_redemptions < max_redemptions
            "#,
        )
        .bind(locked.id)
        .execute(tx.conn())
        .await?
        .rows_affected();
        if incremented == 0 {
            return Ok(RedeemOutcome::rejected(
                RejectionReason::ConcurrentExhaustion,
                "This code was just redeemed by someone else",
            ));
        }

        let recorded = sqlx::query(
            r#"
            INSERT INTO ltd_redemptions (code_id, user_id, tier, previous_tier, credits_added)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (code_id, user_id) DO NOTHING
            "#,
        )
        .bind(locked.id)
        .bind(user_id.0)
        .bind(i32::from(code_tier))
        .bind(grant.previous_tier.map(i32::from))
        .bind(grant.credits_added)
        .execute(tx.conn())
        .await?
        .rows_affected();
        if recorded == 0 {
            return Ok(RedeemOutcome::rejected(
                RejectionReason::AlreadyRedeemed,
                "You have already redeemed this code",
            ));
        }

        tx.store(&grant.plan).await?;
        ledger::insert_entry(
            tx.conn(),
            user_id,
            entry::LTD_REDEMPTION,
            -grant.credits_added,
            grant.plan.credits,
            serde_json::json!({
                "code_id": locked.id,
                "code_tier": code_tier.get(),
                "tier": grant.plan.ltd_tier.map(|t| t.get()),
            }),
        )
        .await?;
        tx.commit().await?;

        let tier = grant.plan.ltd_tier.unwrap_or(code_tier);
        tracing::info!(
            user_id = %user_id,
            code = %code,
            code_tier = code_tier.get(),
            tier = tier.get(),
            credits_added = grant.credits_added,
            credits = grant.plan.credits,
            stacked_codes = grant.plan.stacked_codes,
            "Code redeemed"
        );

        Ok(RedeemOutcome::Redeemed {
            tier,
            previous_tier: grant.previous_tier,
            credits: grant.plan.credits,
            credits_added: grant.credits_added,
            monthly_limit: grant.plan.monthly_credit_limit,
            stacked_codes: grant.plan.stacked_codes,
        })
    }

    async fn already_redeemed(
        conn: &mut sqlx::PgConnection,
        code: &LtdCode,
        user_id: UserId,
    ) -> CreditResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM ltd_redemptions WHERE code_id = $1 AND user_id = $2)",
        )
        .bind(code.id)
        .bind(user_id.0)
        .fetch_one(conn)
        .await?;
        Ok(exists)
    }

    /// A user's redemptions, newest first
    pub async fn user_redemptions(&self, user_id: UserId) -> CreditResult<Vec<RedemptionRecord>> {
        let records: Vec<RedemptionRecord> = sqlx::query_as(
            r#"
            SELECT r.id, r.code_id, c.code, r.tier, r.previous_tier, r.credits_added, r.redeemed_at
            FROM ltd_redemptions r
            JOIN ltd_codes c ON c.id = r.code_id
            WHERE r.user_id = $1
            ORDER BY r.redeemed_at DESC, r.id DESC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(self.plans.pool())
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2025-03-31 09:00 UTC);

    fn tier(n: u8) -> LtdTier {
        LtdTier::new(n).unwrap()
    }

    fn plan(plan_type: PlanType, ltd_tier: Option<u8>, credits: i64, limit: i64) -> UserPlan {
        UserPlan {
            user_id: UserId(Uuid::nil()),
            email: "creator@example.com".into(),
            plan_type,
            ltd_tier: ltd_tier.map(tier),
            credits,
            monthly_credit_limit: limit,
            rollover_credits: 0,
            credit_reset_date: None,
            stacked_codes: 0,
        }
    }

    #[test]
    fn test_first_redemption_converts_free_plan() {
        let grant = compute_grant(&plan(PlanType::Free, None, 4, 10), tier(2), 300, NOW).unwrap();
        assert_eq!(grant.plan.plan_type, PlanType::Ltd);
        assert_eq!(grant.plan.ltd_tier, Some(tier(2)));
        assert_eq!(grant.plan.credits, 304);
        assert_eq!(grant.plan.monthly_credit_limit, 300);
        assert_eq!(grant.plan.stacked_codes, 1);
        assert_eq!(grant.previous_tier, None);
        assert_eq!(
            grant.plan.credit_reset_date,
            Some(datetime!(2025-04-30 09:00 UTC))
        );
    }

    #[test]
    fn test_lower_tier_code_stacks_without_downgrade() {
        let mut current = plan(PlanType::Ltd, Some(3), 500, 750);
        current.stacked_codes = 1;
        current.credit_reset_date = Some(datetime!(2025-04-10 00:00 UTC));

        let grant = compute_grant(&current, tier(1), 100, NOW).unwrap();
        assert_eq!(grant.plan.ltd_tier, Some(tier(3)));
        assert_eq!(grant.plan.credits, 600);
        assert_eq!(grant.plan.monthly_credit_limit, 850);
        assert_eq!(grant.plan.stacked_codes, 2);
        assert_eq!(grant.previous_tier, Some(tier(3)));
        assert_eq!(
            grant.plan.credit_reset_date,
            Some(datetime!(2025-04-10 00:00 UTC))
        );
    }

    #[test]
    fn test_higher_tier_code_upgrades() {
        let current = plan(PlanType::Ltd, Some(1), 20, 100);
        let grant = compute_grant(&current, tier(4), 2000, NOW).unwrap();
        assert_eq!(grant.plan.ltd_tier, Some(tier(4)));
        assert_eq!(grant.plan.monthly_credit_limit, 2000);
        assert_eq!(grant.plan.credits, 2020);
        assert_eq!(grant.previous_tier, Some(tier(1)));
    }

    #[test]
    fn test_upgrade_keeps_larger_stacked_limit() {
        let current = plan(PlanType::Ltd, Some(1), 0, 900);
        let grant = compute_grant(&current, tier(2), 300, NOW).unwrap();
        assert_eq!(grant.plan.ltd_tier, Some(tier(2)));
        assert_eq!(grant.plan.monthly_credit_limit, 900);
        assert_eq!(grant.plan.credits, 300);
    }

    #[test]
    fn test_same_tier_code_stacks_limit() {
        let current = plan(PlanType::Ltd, Some(2), 50, 300);
        let grant = compute_grant(&current, tier(2), 300, NOW).unwrap();
        assert_eq!(grant.plan.ltd_tier, Some(tier(2)));
        assert_eq!(grant.plan.monthly_credit_limit, 600);
        assert_eq!(grant.plan.credits, 350);
    }

    #[test]
    fn test_rollover_is_untouched_by_grant() {
        let mut current = plan(PlanType::Ltd, Some(2), 10, 300);
        current.rollover_credits = 55;
        let grant = compute_grant(&current, tier(2), 300, NOW).unwrap();
        assert_eq!(grant.plan.rollover_credits, 55);
    }

    #[test]
    fn test_grant_overflow_is_rejected() {
        let full = plan(PlanType::Ltd, Some(1), i64::MAX, 100);
        assert!(compute_grant(&full, tier(1), 100, NOW).is_err());
    }

    #[test]
    fn test_redemption_result_shape() {
        let ok = RedeemOutcome::Redeemed {
            tier: tier(2),
            previous_tier: None,
            credits: 300,
            credits_added: 300,
            monthly_limit: 300,
            stacked_codes: 1,
        };
        let json = serde_json::to_value(RedemptionResult::from(&ok)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": true, "tier": 2, "credits": 300 })
        );

        let rejected = RedeemOutcome::rejected(RejectionReason::AlreadyRedeemed, "again");
        let json = serde_json::to_value(RedemptionResult::from(&rejected)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "ALREADY_REDEEMED");
    }
}
