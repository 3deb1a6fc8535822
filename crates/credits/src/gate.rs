//! Feature Gate
//!
//! The read path. Combines the tier table, the ledger balance and the monthly
//! counters into access decisions. Nothing here mutates except the lazy
//! monthly reset triggered by [`FeatureGate::get_user_plan`]; callers perform
//! the gated action and then call `deduct` / `increment` themselves.

use std::sync::Arc;

use repurpose_shared::types::{LtdTier, PlanType, UserId};
use serde::Serialize;

use crate::counters::{LimitCheck, UsageCounters};
use crate::error::CreditResult;
use crate::ledger::CreditLedger;
use crate::outcome::RejectionReason;
use crate::plan::{PlanStore, UserPlan};
use crate::tiers::{Feature, Limit, TierTable};

/// `{has_access, reason?, upgrade_required?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub has_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Lowest LTD tier that unlocks the feature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_required: Option<LtdTier>,
    /// Cap attached to the feature, when it has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
}

impl AccessDecision {
    fn granted(limit: Option<Limit>) -> Self {
        Self {
            has_access: true,
            reason: None,
            message: None,
            upgrade_required: None,
            limit,
        }
    }

    fn denied(reason: RejectionReason, message: String, upgrade_required: Option<LtdTier>) -> Self {
        Self {
            has_access: false,
            reason: Some(reason),
            message: Some(message),
            upgrade_required,
            limit: None,
        }
    }

    fn user_not_found() -> Self {
        Self::denied(RejectionReason::UserNotFound, "User not found".into(), None)
    }
}

/// `{has_access, cost, remaining}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditAccess {
    pub has_access: bool,
    pub cost: i64,
    pub remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
}

/// Everything a credit-costing action needs before it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionDecision {
    pub action: String,
    pub feature: AccessDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<LimitCheck>,
    pub credits: CreditAccess,
}

impl ActionDecision {
    pub fn allowed(&self) -> bool {
        self.feature.has_access
            && self.credits.has_access
            && self.usage.as_ref().is_none_or(|u| u.allowed)
    }

    /// First reason the action is blocked, in gate order: feature, cap, credits
    pub fn reason(&self) -> Option<RejectionReason> {
        self.feature
            .reason
            .or_else(|| self.usage.as_ref().and_then(|u| u.reason))
            .or(self.credits.reason)
    }
}

/// Tier whose price applies to `plan` (LTD plans only)
fn pricing_tier(plan: &UserPlan) -> Option<LtdTier> {
    match plan.plan_type {
        PlanType::Ltd => plan.ltd_tier,
        PlanType::Free | PlanType::Pro => None,
    }
}

/// Pure feature decision
pub fn decide_feature(
    table: &TierTable,
    plan: &UserPlan,
    feature: Feature,
) -> CreditResult<AccessDecision> {
    let config = table.plan(plan.plan_type, plan.ltd_tier)?;
    if config.features.grants(feature) {
        let limit = match feature {
            Feature::Scheduling => Some(config.features.scheduling),
            Feature::AiChat => Some(config.features.ai_chat),
            Feature::StyleTraining => Some(config.features.style_training),
            Feature::TeamCollaboration => Some(config.features.team_collaboration),
            Feature::ApiAccess => Some(config.features.api_access),
            _ => None,
        };
        return Ok(AccessDecision::granted(limit));
    }

    let upgrade_required = table.min_tier_for(feature);
    Ok(AccessDecision::denied(
        RejectionReason::TierRestricted,
        format!("{} is not available on {}", feature, config.name),
        upgrade_required,
    ))
}

/// Pure credit decision
pub fn decide_credits(
    table: &TierTable,
    plan: &UserPlan,
    action: &str,
) -> CreditResult<CreditAccess> {
    let cost = table.calculate_credit_cost(action, pricing_tier(plan))?;
    let has_access = plan.credits >= cost;
    Ok(CreditAccess {
        has_access,
        cost,
        remaining: plan.credits,
        reason: (!has_access).then_some(RejectionReason::InsufficientCredits),
    })
}

#[derive(Clone)]
pub struct FeatureGate {
    plans: PlanStore,
    ledger: CreditLedger,
    counters: UsageCounters,
    tiers: Arc<TierTable>,
}

impl FeatureGate {
    pub fn new(
        plans: PlanStore,
        ledger: CreditLedger,
        counters: UsageCounters,
        tiers: Arc<TierTable>,
    ) -> Self {
        Self {
            plans,
            ledger,
            counters,
            tiers,
        }
    }

    /// Current plan, applying a due monthly reset first
    pub async fn get_user_plan(&self, user_id: UserId) -> CreditResult<Option<UserPlan>> {
        match self.ledger.reset_if_due(user_id).await {
            Ok(_) => {}
            // Whoever holds the row lock will apply the reset
            Err(e) if e.is_retryable() => {
                tracing::warn!(user_id = %user_id, error = %e, "Skipped lazy credit reset");
            }
            Err(e) => return Err(e),
        }
        self.plans.get(user_id).await
    }

    pub async fn check_feature_access(
        &self,
        user_id: UserId,
        feature: Feature,
    ) -> CreditResult<AccessDecision> {
        match self.get_user_plan(user_id).await? {
            Some(plan) => decide_feature(&self.tiers, &plan, feature),
            None => Ok(AccessDecision::user_not_found()),
        }
    }

    /// Read-only price check; never deducts
    pub async fn check_credit_access(
        &self,
        user_id: UserId,
        action: &str,
    ) -> CreditResult<CreditAccess> {
        // Unknown actions are rejected even for unknown users
        self.tiers.action(action)?;
        match self.get_user_plan(user_id).await? {
            Some(plan) => decide_credits(&self.tiers, &plan, action),
            None => Ok(CreditAccess {
                has_access: false,
                cost: 0,
                remaining: 0,
                reason: Some(RejectionReason::UserNotFound),
            }),
        }
    }

    /// Feature, monthly cap and price for `action`, all read-only
    pub async fn check_action_access(
        &self,
        user_id: UserId,
        action: &str,
    ) -> CreditResult<ActionDecision> {
        let cost = self.tiers.action(action)?.clone();
        let Some(plan) = self.get_user_plan(user_id).await? else {
            return Ok(ActionDecision {
                action: action.to_string(),
                feature: AccessDecision::user_not_found(),
                usage: None,
                credits: CreditAccess {
                    has_access: false,
                    cost: 0,
                    remaining: 0,
                    reason: Some(RejectionReason::UserNotFound),
                },
            });
        };

        let feature = match cost.feature {
            Some(feature) => decide_feature(&self.tiers, &plan, feature)?,
            None => AccessDecision::granted(None),
        };
        let usage = match cost.counter {
            Some(counter) if feature.has_access => {
                let limit = self
                    .tiers
                    .plan(plan.plan_type, plan.ltd_tier)?
                    .features
                    .counter_limit(counter);
                Some(self.counters.check_against(user_id, counter, limit).await?)
            }
            _ => None,
        };
        let credits = decide_credits(&self.tiers, &plan, action)?;

        Ok(ActionDecision {
            action: action.to_string(),
            feature,
            usage,
            credits,
        })
    }
}
