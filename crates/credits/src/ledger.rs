//! Credit Ledger
//!
//! Owns the balance fields of a plan (`credits`, `rollover_credits`) and the
//! append-only `credit_usage_log`. Every balance change writes exactly one log
//! entry in the same transaction: positive `credits_used` is a debit, negative
//! a credit, so the log sums to the materialized balance.
//!
//! The ledger is tier-agnostic. Prices are resolved by the feature gate before
//! `deduct` is called.

use std::sync::Arc;

use repurpose_shared::types::{next_reset_after, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::{CreditError, CreditResult};
use crate::outcome::RejectionReason;
use crate::plan::{PlanStore, PlanTx, UserPlan};
use crate::tiers::TierTable;

/// Ledger entry action types written by the engine itself
pub mod entry {
    pub const CREDIT_ADDITION: &str = "credit_addition";
    pub const CREDIT_ADJUSTMENT: &str = "credit_adjustment";
    pub const MONTHLY_RESET: &str = "monthly_reset";
    pub const LTD_REDEMPTION: &str = "ltd_redemption";
}

/// Longest accepted action type
const MAX_ACTION_TYPE_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeductOutcome {
    Deducted { charged: i64, remaining: i64 },
    Rejected {
        reason: RejectionReason,
        remaining: i64,
    },
}

impl DeductOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeductOutcome::Deducted { .. })
    }

    pub fn remaining(&self) -> i64 {
        match self {
            DeductOutcome::Deducted { remaining, .. }
            | DeductOutcome::Rejected { remaining, .. } => *remaining,
        }
    }
}

/// Balance after a monthly reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetResult {
    pub credits: i64,
    pub rollover: i64,
    /// Unused credits above the rollover cap
    pub discarded: i64,
    pub next_reset: OffsetDateTime,
}

/// Outcome of a batch credit refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSweep {
    pub examined: usize,
    pub reset: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditUsageEntry {
    pub id: i64,
    pub action_type: String,
    pub credits_used: i64,
    pub credits_remaining: i64,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Per-action debit totals over a window
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionUsage {
    pub action_type: String,
    pub usage_count: i64,
    pub total_credits_used: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
}

// =============================================================================
// Pure balance arithmetic
// =============================================================================

/// New balance after charging `amount`, or `None` when it would go negative
pub fn compute_deduction(balance: i64, amount: i64) -> Option<i64> {
    balance.checked_sub(amount).filter(|remaining| *remaining >= 0)
}

/// Whether a plan with this reset date is due at `now`
pub fn reset_due(reset_date: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    reset_date.is_some_and(|due| now >= due)
}

/// Reset a plan if its reset date has passed.
///
/// `rollover = min(unused, cap)`; the new balance is the monthly limit plus the
/// rollover, and the reset date advances to the first anniversary after `now`.
pub fn compute_reset(
    plan: &UserPlan,
    rollover_cap: i64,
    now: OffsetDateTime,
) -> CreditResult<Option<ResetResult>> {
    let due = match plan.credit_reset_date {
        Some(due) if reset_due(Some(due), now) => due,
        _ => return Ok(None),
    };

    let unused = plan.credits.max(0);
    let rollover = unused.min(rollover_cap.max(0));
    let credits = plan
        .monthly_credit_limit
        .checked_add(rollover)
        .ok_or_else(|| CreditError::Internal("credit balance overflow".into()))?;

    Ok(Some(ResetResult {
        credits,
        rollover,
        discarded: unused - rollover,
        next_reset: next_reset_after(due, now)?,
    }))
}

fn validate_action_type(action_type: &str) -> CreditResult<()> {
    if action_type.trim().is_empty() || action_type.len() > MAX_ACTION_TYPE_LENGTH {
        return Err(CreditError::InvalidInput(format!(
            "action type must be 1-{} characters",
            MAX_ACTION_TYPE_LENGTH
        )));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> CreditResult<()> {
    if amount < 0 {
        return Err(CreditError::InvalidInput(
            "amount must be non-negative".into(),
        ));
    }
    Ok(())
}

/// Append a ledger entry on the caller's transaction
pub(crate) async fn insert_entry(
    conn: &mut PgConnection,
    user_id: UserId,
    action_type: &str,
    credits_used: i64,
    credits_remaining: i64,
    metadata: serde_json::Value,
) -> CreditResult<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_usage_log
            (user_id, action_type, credits_used, credits_remaining, metadata)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(user_id.0)
    .bind(action_type)
    .bind(credits_used)
    .bind(credits_remaining)
    .bind(metadata)
    .execute(conn)
    .await?;
    Ok(())
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Clone)]
pub struct CreditLedger {
    plans: PlanStore,
    tiers: Arc<TierTable>,
}

impl CreditLedger {
    pub fn new(plans: PlanStore, tiers: Arc<TierTable>) -> Self {
        Self { plans, tiers }
    }

    /// Charge `amount` credits. Never deducts partially.
    pub async fn deduct(
        &self,
        user_id: UserId,
        amount: i64,
        action_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> CreditResult<DeductOutcome> {
        validate_amount(amount)?;
        validate_action_type(action_type)?;

        let mut tx = self.plans.begin().await?;
        let Some(mut plan) = tx.lock_user(user_id).await? else {
            return Ok(DeductOutcome::Rejected {
                reason: RejectionReason::UserNotFound,
                remaining: 0,
            });
        };

        // A charge landing after the reset date spends the new cycle's credits
        self.apply_due_reset(&mut tx, &mut plan, OffsetDateTime::now_utc()).await?;

        let Some(remaining) = compute_deduction(plan.credits, amount) else {
            // Commit so a reset applied above is kept
            tx.commit().await?;
            tracing::debug!(
                user_id = %user_id,
                action_type,
                amount,
                balance = plan.credits,
                "Deduction rejected: insufficient credits"
            );
            return Ok(DeductOutcome::Rejected {
                reason: RejectionReason::InsufficientCredits,
                remaining: plan.credits,
            });
        };

        plan.credits = remaining;
        tx.store(&plan).await?;
        insert_entry(
            tx.conn(),
            user_id,
            action_type,
            amount,
            remaining,
            metadata.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            action_type,
            charged = amount,
            remaining,
            "Credits deducted"
        );

        Ok(DeductOutcome::Deducted {
            charged: amount,
            remaining,
        })
    }

    /// Grant credits (admin or system). Returns the new balance.
    pub async fn add(&self, user_id: UserId, amount: i64, reason: &str) -> CreditResult<i64> {
        validate_amount(amount)?;

        let mut tx = self.plans.begin().await?;
        let mut plan = tx
            .lock_user(user_id)
            .await?
            .ok_or_else(|| CreditError::NotFound(format!("user {}", user_id)))?;

        plan.credits = plan
            .credits
            .checked_add(amount)
            .ok_or_else(|| CreditError::InvalidInput("credit balance overflow".into()))?;
        tx.store(&plan).await?;
        insert_entry(
            tx.conn(),
            user_id,
            entry::CREDIT_ADDITION,
            -amount,
            plan.credits,
            serde_json::json!({ "reason": reason }),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, amount, total = plan.credits, reason, "Credits added");
        Ok(plan.credits)
    }

    /// Overwrite the balance, logging the signed difference. Returns the new balance.
    pub async fn set_balance(
        &self,
        user_id: UserId,
        amount: i64,
        reason: &str,
    ) -> CreditResult<i64> {
        validate_amount(amount)?;

        let mut tx = self.plans.begin().await?;
        let mut plan = tx
            .lock_user(user_id)
            .await?
            .ok_or_else(|| CreditError::NotFound(format!("user {}", user_id)))?;

        let previous = plan.credits;
        plan.credits = amount;
        tx.store(&plan).await?;
        insert_entry(
            tx.conn(),
            user_id,
            entry::CREDIT_ADJUSTMENT,
            previous - amount,
            amount,
            serde_json::json!({ "reason": reason, "previous": previous }),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, previous, amount, reason, "Credit balance set");
        Ok(amount)
    }

    /// Apply the monthly reset if it is due. Safe to call redundantly: only the
    /// first caller after the due date changes anything.
    ///
    /// The due date is read without a lock first, so reads of plans that are
    /// not due never wait on the user row.
    pub async fn reset_if_due(&self, user_id: UserId) -> CreditResult<bool> {
        let now = OffsetDateTime::now_utc();
        let reset_date: Option<Option<OffsetDateTime>> =
            sqlx::query_scalar("SELECT credit_reset_date FROM users WHERE id = $1")
                .bind(user_id.0)
                .fetch_optional(self.plans.pool())
                .await?;
        if !reset_due(reset_date.flatten(), now) {
            return Ok(false);
        }

        // Re-checked under the lock; a concurrent caller may have reset it
        let mut tx = self.plans.begin().await?;
        let Some(mut plan) = tx.lock_user(user_id).await? else {
            return Ok(false);
        };

        let applied = self.apply_due_reset(&mut tx, &mut plan, now).await?;
        if applied {
            tx.commit().await?;
        }
        Ok(applied)
    }

    /// Reset on an already locked plan. Caller commits.
    pub(crate) async fn apply_due_reset(
        &self,
        tx: &mut PlanTx,
        plan: &mut UserPlan,
        now: OffsetDateTime,
    ) -> CreditResult<bool> {
        let config = self.tiers.plan(plan.plan_type, plan.ltd_tier)?;
        let cap = config.rollover_cap(plan.monthly_credit_limit);
        let Some(reset) = compute_reset(plan, cap, now)? else {
            return Ok(false);
        };

        let previous = plan.credits;
        plan.credits = reset.credits;
        plan.rollover_credits = reset.rollover;
        plan.credit_reset_date = Some(reset.next_reset);
        tx.store(plan).await?;
        insert_entry(
            tx.conn(),
            plan.user_id,
            entry::MONTHLY_RESET,
            previous - reset.credits,
            reset.credits,
            serde_json::json!({
                "monthly_limit": plan.monthly_credit_limit,
                "rollover": reset.rollover,
                "discarded": reset.discarded,
                "next_reset": reset.next_reset.unix_timestamp(),
            }),
        )
        .await?;

        tracing::info!(
            user_id = %plan.user_id,
            credits = reset.credits,
            rollover = reset.rollover,
            discarded = reset.discarded,
            next_reset = %reset.next_reset,
            "Monthly credits reset"
        );
        Ok(true)
    }

    /// Reset up to `limit` due users, each in its own transaction
    pub async fn reset_all_due(&self, limit: i64) -> CreditResult<ResetSweep> {
        let due: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM users
            WHERE credit_reset_date IS NOT NULL AND credit_reset_date <= NOW()
            ORDER BY credit_reset_date ASC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 10_000))
        .fetch_all(self.plans.pool())
        .await?;

        let mut sweep = ResetSweep {
            examined: due.len(),
            ..ResetSweep::default()
        };
        for id in due {
            match self.reset_if_due(UserId(id)).await {
                Ok(true) => sweep.reset += 1,
                Ok(false) => {}
                Err(e) => {
                    sweep.failed += 1;
                    tracing::error!(user_id = %id, error = %e, "Credit reset failed");
                }
            }
        }
        Ok(sweep)
    }

    pub async fn credits_remaining(&self, user_id: UserId) -> CreditResult<Option<i64>> {
        Ok(self.plans.get(user_id).await?.map(|plan| plan.credits))
    }

    /// Debits per action over the last `days` days
    pub async fn usage_analytics(
        &self,
        user_id: UserId,
        days: i32,
    ) -> CreditResult<Vec<ActionUsage>> {
        if !(1..=365).contains(&days) {
            return Err(CreditError::InvalidInput(
                "days must be between 1 and 365".into(),
            ));
        }

        let usage: Vec<ActionUsage> = sqlx::query_as(
            r#"
            SELECT
                action_type,
                COUNT(*) AS usage_count,
                SUM(credits_used)::bigint AS total_credits_used,
                MAX(created_at) AS last_used
            FROM credit_usage_log
            WHERE user_id = $1
              AND created_at >= NOW() - make_interval(days => $2)
              AND credits_used > 0
            GROUP BY action_type
            ORDER BY total_credits_used DESC
            "#,
        )
        .bind(user_id.0)
        .bind(days)
        .fetch_all(self.plans.pool())
        .await?;
        Ok(usage)
    }

    /// Most recent ledger entries, newest first
    pub async fn usage_history(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> CreditResult<Vec<CreditUsageEntry>> {
        let entries: Vec<CreditUsageEntry> = sqlx::query_as(
            r#"
            SELECT id, action_type, credits_used, credits_remaining, metadata, created_at
            FROM credit_usage_log
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.0)
        .bind(limit.clamp(1, 500))
        .fetch_all(self.plans.pool())
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repurpose_shared::types::{LtdTier, PlanType};
    use time::macros::datetime;
    use uuid::Uuid;

    fn ltd_plan(credits: i64, limit: i64, reset: Option<OffsetDateTime>) -> UserPlan {
        UserPlan {
            user_id: UserId(Uuid::nil()),
            email: "creator@example.com".into(),
            plan_type: PlanType::Ltd,
            ltd_tier: Some(LtdTier::new(2).unwrap()),
            credits,
            monthly_credit_limit: limit,
            rollover_credits: 0,
            credit_reset_date: reset,
            stacked_codes: 1,
        }
    }

    #[test]
    fn test_deduction_never_goes_negative() {
        assert_eq!(compute_deduction(5, 8), None);
        assert_eq!(compute_deduction(5, 3), Some(2));
        assert_eq!(compute_deduction(5, 5), Some(0));
        assert_eq!(compute_deduction(0, 0), Some(0));
        assert_eq!(compute_deduction(i64::MIN, 1), None);
    }

    #[test]
    fn test_reset_not_due() {
        let plan = ltd_plan(40, 300, Some(datetime!(2025-07-01 00:00 UTC)));
        let result = compute_reset(&plan, 3600, datetime!(2025-06-15 00:00 UTC)).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_reset_without_date_is_noop() {
        let plan = ltd_plan(40, 300, None);
        assert_eq!(
            compute_reset(&plan, 3600, datetime!(2025-06-15 00:00 UTC)).unwrap(),
            None
        );
    }

    #[test]
    fn test_reset_due_boundary() {
        let due = datetime!(2025-07-01 00:00 UTC);
        assert!(!reset_due(None, due));
        assert!(!reset_due(Some(due), datetime!(2025-06-30 23:59:59 UTC)));
        assert!(reset_due(Some(due), due));
        assert!(reset_due(Some(due), datetime!(2025-09-01 00:00 UTC)));
    }

    #[test]
    fn test_reset_carries_unused_credits() {
        let plan = ltd_plan(40, 300, Some(datetime!(2025-06-01 00:00 UTC)));
        let reset = compute_reset(&plan, 3600, datetime!(2025-06-01 00:00 UTC))
            .unwrap()
            .unwrap();
        assert_eq!(reset.credits, 340);
        assert_eq!(reset.rollover, 40);
        assert_eq!(reset.discarded, 0);
        assert_eq!(reset.next_reset, datetime!(2025-07-01 00:00 UTC));
    }

    #[test]
    fn test_reset_discards_above_cap() {
        let plan = ltd_plan(5000, 300, Some(datetime!(2025-06-01 00:00 UTC)));
        let reset = compute_reset(&plan, 3600, datetime!(2025-06-02 00:00 UTC))
            .unwrap()
            .unwrap();
        assert_eq!(reset.rollover, 3600);
        assert_eq!(reset.discarded, 1400);
        assert_eq!(reset.credits, 3900);
        assert!(reset.credits <= plan.monthly_credit_limit + 3600);
    }

    #[test]
    fn test_reset_with_zero_cap_drops_everything() {
        let plan = ltd_plan(7, 10, Some(datetime!(2025-06-01 00:00 UTC)));
        let reset = compute_reset(&plan, 0, datetime!(2025-06-01 00:00 UTC))
            .unwrap()
            .unwrap();
        assert_eq!(reset.credits, 10);
        assert_eq!(reset.rollover, 0);
        assert_eq!(reset.discarded, 7);
    }

    #[test]
    fn test_reset_is_idempotent_once_applied() {
        let now = datetime!(2025-06-01 00:00:01 UTC);
        let mut plan = ltd_plan(40, 300, Some(datetime!(2025-06-01 00:00 UTC)));
        let reset = compute_reset(&plan, 3600, now).unwrap().unwrap();
        plan.credits = reset.credits;
        plan.rollover_credits = reset.rollover;
        plan.credit_reset_date = Some(reset.next_reset);

        assert_eq!(compute_reset(&plan, 3600, now).unwrap(), None);
    }

    #[test]
    fn test_overdue_reset_applies_once() {
        let plan = ltd_plan(40, 300, Some(datetime!(2025-01-15 00:00 UTC)));
        let reset = compute_reset(&plan, 3600, datetime!(2025-06-20 00:00 UTC))
            .unwrap()
            .unwrap();
        assert_eq!(reset.next_reset, datetime!(2025-07-15 00:00 UTC));
    }

    #[test]
    fn test_action_type_validation() {
        assert!(validate_action_type("viral_hook").is_ok());
        assert!(validate_action_type("  ").is_err());
        assert!(validate_action_type(&"x".repeat(65)).is_err());
        assert!(validate_amount(-1).is_err());
    }

    #[test]
    fn test_deduct_outcome_shape() {
        let outcome = DeductOutcome::Rejected {
            reason: RejectionReason::InsufficientCredits,
            remaining: 5,
        };
        assert!(!outcome.is_success());
        assert_eq!(outcome.remaining(), 5);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "INSUFFICIENT_CREDITS");
    }
}
