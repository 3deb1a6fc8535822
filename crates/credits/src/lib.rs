#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Repurpose Credits Engine
//!
//! Lifetime-deal redemption codes, per-user credit balances and tier
//! entitlements.
//!
//! ## Components
//!
//! - **Code Registry**: issue, look up and retire redemption codes
//! - **Redemption Processor**: turn a code into a tier upgrade plus credits
//! - **Credit Ledger**: balances, deductions, grants and monthly resets
//! - **Usage Counters**: hard monthly caps per feature
//! - **Feature Gate**: read-only access decisions
//! - **Admin**: LTD user administration, audit log and CSV export
//!
//! All plan writes go through [`plan::PlanTx`], which locks the user row before
//! any code row.

pub mod admin;
pub mod audit;
pub mod codes;
pub mod counters;
pub mod error;
pub mod export;
pub mod gate;
pub mod invariants;
pub mod ledger;
pub mod outcome;
pub mod plan;
pub mod redemption;
pub mod tiers;

// Admin
pub use admin::{AdminService, LtdUserDetail, LtdUserSummary, PlanChange, UserFilter, UserPage};

// Audit
pub use audit::{AdminAction, AdminActionFilter, AdminActionRecord, AdminAuditLog};

// Codes
pub use codes::{
    CodeDefect, CodeFilter, CodePage, CodeRegistry, CodeSelector, CodeStatistics,
    CodeStatusFilter, CodeUpdate, CodeValidation, GenerateCodesRequest, GeneratedBatch, LtdCode,
};

// Counters
pub use counters::{LimitCheck, UsageCounters};

// Error
pub use error::{CreditError, CreditResult};

// Gate
pub use gate::{AccessDecision, ActionDecision, CreditAccess, FeatureGate};

// Invariants
pub use invariants::{
    Invariant, InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{ActionUsage, CreditLedger, CreditUsageEntry, DeductOutcome, ResetSweep};

// Outcome
pub use outcome::RejectionReason;

// Plan
pub use plan::{PlanSnapshot, PlanStore, UserPlan, DEFAULT_LOCK_TIMEOUT_MS};

// Redemption
pub use redemption::{RedeemOutcome, RedemptionProcessor, RedemptionRecord, RedemptionResult};

// Tiers
pub use tiers::{
    ActionCost, CounterFeature, CreditCostTable, Feature, Limit, PlanConfig, TierFeatures,
    TierTable,
};

use std::sync::Arc;

use repurpose_shared::types::UserId;
use serde::Serialize;
use sqlx::PgPool;

/// Result of charging a gated action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Charged {
        action: String,
        charged: i64,
        remaining: i64,
        /// This month's counter after the charge, for capped actions
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<i64>,
    },
    Rejected {
        action: String,
        reason: RejectionReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        upgrade_required: Option<repurpose_shared::types::LtdTier>,
    },
}

/// Every engine service, sharing one pool and one tier table
#[derive(Clone)]
pub struct CreditEngine {
    pub tiers: Arc<TierTable>,
    pub plans: PlanStore,
    pub codes: CodeRegistry,
    pub redemptions: RedemptionProcessor,
    pub ledger: CreditLedger,
    pub counters: UsageCounters,
    pub gate: FeatureGate,
    pub audit: AdminAuditLog,
    pub admin: AdminService,
}

impl CreditEngine {
    pub fn new(pool: PgPool, tiers: TierTable, lock_timeout_ms: u64) -> Self {
        let tiers = Arc::new(tiers);
        let plans = PlanStore::new(pool.clone(), lock_timeout_ms);
        let audit = AdminAuditLog::new(pool.clone());
        let codes = CodeRegistry::new(pool.clone(), audit.clone());
        let ledger = CreditLedger::new(plans.clone(), tiers.clone());
        let counters = UsageCounters::new(pool, tiers.clone());
        let redemptions = RedemptionProcessor::new(plans.clone(), codes.clone(), tiers.clone());
        let gate = FeatureGate::new(
            plans.clone(),
            ledger.clone(),
            counters.clone(),
            tiers.clone(),
        );
        let admin = AdminService::new(
            plans.clone(),
            ledger.clone(),
            redemptions.clone(),
            audit.clone(),
            tiers.clone(),
        );

        Self {
            tiers,
            plans,
            codes,
            redemptions,
            ledger,
            counters,
            gate,
            audit,
            admin,
        }
    }

    pub fn invariant_checker(&self) -> InvariantChecker {
        InvariantChecker::new(self.plans.pool().clone())
    }

    /// Charge a completed action: gate it, take one unit of its monthly cap,
    /// then deduct its price. A rejected deduction gives the unit back.
    pub async fn charge_action(
        &self,
        user_id: UserId,
        action: &str,
        metadata: Option<serde_json::Value>,
    ) -> CreditResult<ChargeOutcome> {
        let decision = self.gate.check_action_access(user_id, action).await?;
        if let Some(reason) = decision.feature.reason {
            return Ok(ChargeOutcome::Rejected {
                action: action.to_string(),
                reason,
                upgrade_required: decision.feature.upgrade_required,
            });
        }
        if let Some(reason) = decision.credits.reason {
            return Ok(ChargeOutcome::Rejected {
                action: action.to_string(),
                reason,
                upgrade_required: None,
            });
        }
        let cost = decision.credits.cost;

        let counter = self.tiers.action(action)?.counter;
        let consumed = match (counter, decision.usage.as_ref()) {
            (Some(counter), Some(usage)) => {
                let check = self.counters.try_consume(user_id, counter, usage.limit, 1).await?;
                if let Some(reason) = check.reason {
                    return Ok(ChargeOutcome::Rejected {
                        action: action.to_string(),
                        reason,
                        upgrade_required: None,
                    });
                }
                Some((counter, check))
            }
            _ => None,
        };

        let outcome = if cost > 0 {
            self.ledger.deduct(user_id, cost, action, metadata).await
        } else {
            // Free actions are metered by their counter only
            Ok(DeductOutcome::Deducted {
                charged: 0,
                remaining: decision.credits.remaining,
            })
        };

        match outcome {
            Ok(DeductOutcome::Deducted { charged, remaining }) => Ok(ChargeOutcome::Charged {
                action: action.to_string(),
                charged,
                remaining,
                usage: consumed.map(|(_, check)| check.current),
            }),
            Ok(DeductOutcome::Rejected { reason, .. }) => {
                if let Some((counter, check)) = &consumed {
                    self.counters
                        .release(user_id, *counter, &check.month_year, 1)
                        .await?;
                }
                Ok(ChargeOutcome::Rejected {
                    action: action.to_string(),
                    reason,
                    upgrade_required: None,
                })
            }
            Err(e) => {
                if let Some((counter, check)) = &consumed {
                    if let Err(release) = self
                        .counters
                        .release(user_id, *counter, &check.month_year, 1)
                        .await
                    {
                        tracing::error!(
                            user_id = %user_id,
                            action,
                            error = %release,
                            "Failed to release usage unit after failed charge"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}
