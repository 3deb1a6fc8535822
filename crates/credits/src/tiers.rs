//! Tier Configuration Table
//!
//! Static mapping of plan/tier to monthly credit allotment, rollover policy,
//! feature flags and caps, plus the per-action credit cost table.
//!
//! The table is loaded once at process start (built-in defaults, or a JSON file
//! named by `TIER_CONFIG_PATH`) and never mutated at runtime. Adding a tier or an
//! action is a data change: edit the table, bump `version`, redeploy.

use std::collections::BTreeMap;
use std::path::Path;

use repurpose_shared::types::{LtdTier, PlanType};
use serde::{Deserialize, Serialize};

use crate::error::{CreditError, CreditResult};

/// Current version of the built-in table
pub const DEFAULT_TABLE_VERSION: u32 = 1;

/// Rollover window for lifetime-deal tiers, in months of allotment
pub const LTD_ROLLOVER_CAP_MONTHS: u32 = 12;

// =============================================================================
// Limits and features
// =============================================================================

/// A per-feature cap. `Capped(0)` means the feature is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LimitRepr", into = "LimitRepr")]
pub enum Limit {
    Capped(u32),
    Unlimited,
}

impl Default for Limit {
    fn default() -> Self {
        Limit::Capped(0)
    }
}

impl Limit {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Limit::Capped(0))
    }

    pub fn cap(&self) -> Option<u32> {
        match self {
            Limit::Capped(n) => Some(*n),
            Limit::Unlimited => None,
        }
    }

    /// Whether `requested` more units fit on top of `current`
    pub fn allows(&self, current: i64, requested: i64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Capped(cap) => current.saturating_add(requested) <= i64::from(*cap),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Capped(n) => write!(f, "{}", n),
            Limit::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// JSON shape of a limit: a number, or the string "unlimited"
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LimitRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<LimitRepr> for Limit {
    type Error = String;

    fn try_from(repr: LimitRepr) -> Result<Self, Self::Error> {
        match repr {
            LimitRepr::Count(n) => Ok(Limit::Capped(n)),
            LimitRepr::Keyword(word) if word.eq_ignore_ascii_case("unlimited") => {
                Ok(Limit::Unlimited)
            }
            LimitRepr::Keyword(word) => Err(format!("invalid limit: {}", word)),
        }
    }
}

impl From<Limit> for LimitRepr {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Capped(n) => LimitRepr::Count(n),
            Limit::Unlimited => LimitRepr::Keyword("unlimited".to_string()),
        }
    }
}

/// Gated product features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ContentRepurposing,
    TrendingTopics,
    AnalyticsExport,
    ViralHooks,
    Scheduling,
    AiChat,
    PredictivePerformance,
    StyleTraining,
    BulkGeneration,
    TeamCollaboration,
    ApiAccess,
    WhiteLabel,
}

impl Feature {
    pub const ALL: [Feature; 12] = [
        Feature::ContentRepurposing,
        Feature::TrendingTopics,
        Feature::AnalyticsExport,
        Feature::ViralHooks,
        Feature::Scheduling,
        Feature::AiChat,
        Feature::PredictivePerformance,
        Feature::StyleTraining,
        Feature::BulkGeneration,
        Feature::TeamCollaboration,
        Feature::ApiAccess,
        Feature::WhiteLabel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ContentRepurposing => "content_repurposing",
            Feature::TrendingTopics => "trending_topics",
            Feature::AnalyticsExport => "analytics_export",
            Feature::ViralHooks => "viral_hooks",
            Feature::Scheduling => "scheduling",
            Feature::AiChat => "ai_chat",
            Feature::PredictivePerformance => "predictive_performance",
            Feature::StyleTraining => "style_training",
            Feature::BulkGeneration => "bulk_generation",
            Feature::TeamCollaboration => "team_collaboration",
            Feature::ApiAccess => "api_access",
            Feature::WhiteLabel => "white_label",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| CreditError::InvalidInput(format!("Unknown feature: {}", s)))
    }
}

/// Features backed by a monthly usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterFeature {
    Scheduling,
    Chat,
    ApiCalls,
}

impl CounterFeature {
    pub const ALL: [CounterFeature; 3] = [
        CounterFeature::Scheduling,
        CounterFeature::Chat,
        CounterFeature::ApiCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterFeature::Scheduling => "scheduling",
            CounterFeature::Chat => "chat",
            CounterFeature::ApiCalls => "api_calls",
        }
    }

    /// The gated feature this counter meters
    pub fn feature(&self) -> Feature {
        match self {
            CounterFeature::Scheduling => Feature::Scheduling,
            CounterFeature::Chat => Feature::AiChat,
            CounterFeature::ApiCalls => Feature::ApiAccess,
        }
    }
}

impl std::fmt::Display for CounterFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CounterFeature {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduling" => Ok(CounterFeature::Scheduling),
            "chat" | "ai_chat" => Ok(CounterFeature::Chat),
            "api_calls" | "api_access" => Ok(CounterFeature::ApiCalls),
            _ => Err(CreditError::InvalidInput(format!(
                "Unknown usage counter: {}",
                s
            ))),
        }
    }
}

/// Feature flags and caps for one plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierFeatures {
    pub content_repurposing: bool,
    pub trending_topics: bool,
    pub analytics_export: bool,
    pub viral_hooks: bool,
    /// Scheduled posts per month
    pub scheduling: Limit,
    /// AI chat messages per month
    pub ai_chat: Limit,
    pub predictive_performance: bool,
    /// Style profiles
    pub style_training: Limit,
    pub bulk_generation: bool,
    /// Team seats
    pub team_collaboration: Limit,
    /// API calls per month
    pub api_access: Limit,
    pub white_label: bool,
    pub watermark: bool,
}

impl TierFeatures {
    pub fn grants(&self, feature: Feature) -> bool {
        match feature {
            Feature::ContentRepurposing => self.content_repurposing,
            Feature::TrendingTopics => self.trending_topics,
            Feature::AnalyticsExport => self.analytics_export,
            Feature::ViralHooks => self.viral_hooks,
            Feature::Scheduling => self.scheduling.is_enabled(),
            Feature::AiChat => self.ai_chat.is_enabled(),
            Feature::PredictivePerformance => self.predictive_performance,
            Feature::StyleTraining => self.style_training.is_enabled(),
            Feature::BulkGeneration => self.bulk_generation,
            Feature::TeamCollaboration => self.team_collaboration.is_enabled(),
            Feature::ApiAccess => self.api_access.is_enabled(),
            Feature::WhiteLabel => self.white_label,
        }
    }

    /// Monthly cap for a counter feature
    pub fn counter_limit(&self, counter: CounterFeature) -> Limit {
        match counter {
            CounterFeature::Scheduling => self.scheduling,
            CounterFeature::Chat => self.ai_chat,
            CounterFeature::ApiCalls => self.api_access,
        }
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Allotment and entitlements of a single plan or LTD tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    pub name: String,
    pub monthly_credits: i64,
    /// Rollover cap expressed in months of the user's monthly limit
    #[serde(default)]
    pub rollover_cap_months: u32,
    #[serde(default)]
    pub features: TierFeatures,
}

impl PlanConfig {
    /// Most credits that may carry over into the next cycle
    pub fn rollover_cap(&self, monthly_credit_limit: i64) -> i64 {
        monthly_credit_limit.max(0).saturating_mul(i64::from(self.rollover_cap_months))
    }
}

/// A numbered LTD tier entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierEntry {
    pub tier: LtdTier,
    #[serde(flatten)]
    pub config: PlanConfig,
}

// =============================================================================
// Credit costs
// =============================================================================

/// Cost of one action, optionally overridden per LTD tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCost {
    pub label: String,
    pub base_cost: i64,
    #[serde(default)]
    pub tier_overrides: BTreeMap<u8, i64>,
    /// Feature the action requires
    #[serde(default)]
    pub feature: Option<Feature>,
    /// Monthly counter the action consumes
    #[serde(default)]
    pub counter: Option<CounterFeature>,
}

impl ActionCost {
    fn new(label: &str, base_cost: i64) -> Self {
        Self {
            label: label.to_string(),
            base_cost,
            tier_overrides: BTreeMap::new(),
            feature: None,
            counter: None,
        }
    }

    fn requires(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }

    fn consumes(mut self, counter: CounterFeature) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn cost_for(&self, tier: Option<LtdTier>) -> i64 {
        tier.and_then(|t| self.tier_overrides.get(&t.get()).copied())
            .unwrap_or(self.base_cost)
    }
}

/// Action name to cost
pub type CreditCostTable = BTreeMap<String, ActionCost>;

// =============================================================================
// Table
// =============================================================================

/// Versioned tier configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    pub version: u32,
    pub free: PlanConfig,
    pub pro: PlanConfig,
    pub tiers: Vec<TierEntry>,
    pub costs: CreditCostTable,
}

impl Default for TierTable {
    fn default() -> Self {
        let ltd = |tier: u8, name: &str, monthly_credits: i64, features: TierFeatures| TierEntry {
            tier: LtdTier::new(tier).unwrap_or(LtdTier::MIN),
            config: PlanConfig {
                name: name.to_string(),
                monthly_credits,
                rollover_cap_months: LTD_ROLLOVER_CAP_MONTHS,
                features,
            },
        };

        let tier_1 = TierFeatures {
            content_repurposing: true,
            trending_topics: true,
            watermark: true,
            ..TierFeatures::default()
        };
        let tier_2 = TierFeatures {
            analytics_export: true,
            viral_hooks: true,
            scheduling: Limit::Capped(30),
            ..tier_1.clone()
        };
        let tier_3 = TierFeatures {
            scheduling: Limit::Capped(100),
            ai_chat: Limit::Capped(200),
            predictive_performance: true,
            style_training: Limit::Capped(1),
            bulk_generation: true,
            watermark: false,
            ..tier_2.clone()
        };
        let tier_4 = TierFeatures {
            scheduling: Limit::Unlimited,
            ai_chat: Limit::Unlimited,
            style_training: Limit::Capped(3),
            team_collaboration: Limit::Capped(3),
            api_access: Limit::Capped(2500),
            white_label: true,
            ..tier_3.clone()
        };
        let tier_5 = TierFeatures {
            style_training: Limit::Capped(10),
            team_collaboration: Limit::Capped(10),
            api_access: Limit::Capped(10_000),
            ..tier_4.clone()
        };

        let free = PlanConfig {
            name: "Free".to_string(),
            monthly_credits: 10,
            rollover_cap_months: 0,
            features: TierFeatures {
                content_repurposing: true,
                trending_topics: true,
                watermark: true,
                ..TierFeatures::default()
            },
        };
        let pro = PlanConfig {
            name: "Pro".to_string(),
            monthly_credits: 1000,
            rollover_cap_months: 0,
            features: TierFeatures {
                content_repurposing: true,
                trending_topics: true,
                analytics_export: true,
                viral_hooks: true,
                scheduling: Limit::Capped(50),
                predictive_performance: true,
                ..TierFeatures::default()
            },
        };

        let costs: CreditCostTable = [
            (
                "content_repurposing",
                ActionCost::new("Content Repurposing (per platform)", 1)
                    .requires(Feature::ContentRepurposing),
            ),
            (
                "viral_hook",
                ActionCost::new("Viral Hook Generation", 2).requires(Feature::ViralHooks),
            ),
            (
                "trend_content",
                ActionCost::new("Trend-Based Content", 1).requires(Feature::TrendingTopics),
            ),
            (
                "schedule_post",
                ActionCost::new("Schedule Post", 1)
                    .requires(Feature::Scheduling)
                    .consumes(CounterFeature::Scheduling),
            ),
            (
                "performance_prediction",
                ActionCost::new("AI Performance Prediction", 1)
                    .requires(Feature::PredictivePerformance),
            ),
            (
                "ai_chat_conversation",
                ActionCost::new("AI Chat (per 2 messages)", 1)
                    .requires(Feature::AiChat)
                    .consumes(CounterFeature::Chat),
            ),
            (
                "style_training",
                ActionCost::new("Style Training Session", 5).requires(Feature::StyleTraining),
            ),
            (
                "bulk_generation",
                ActionCost::new("Bulk Generation (per piece)", 1).requires(Feature::BulkGeneration),
            ),
            (
                "api_request",
                ActionCost::new("API Request", 0)
                    .requires(Feature::ApiAccess)
                    .consumes(CounterFeature::ApiCalls),
            ),
        ]
        .into_iter()
        .map(|(action, cost)| (action.to_string(), cost))
        .collect();

        Self {
            version: DEFAULT_TABLE_VERSION,
            free,
            pro,
            tiers: vec![
                ltd(1, "License Tier 1", 100, tier_1),
                ltd(2, "License Tier 2", 300, tier_2),
                ltd(3, "License Tier 3", 750, tier_3),
                ltd(4, "License Tier 4", 2000, tier_4),
                ltd(5, "License Tier 5", 5000, tier_5),
            ],
            costs,
        }
    }
}

impl TierTable {
    /// Load the table from a JSON file, or the built-in defaults when no path is given
    pub fn load(path: Option<&Path>) -> CreditResult<Self> {
        let table = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CreditError::Config(format!(
                        "Failed to read tier config {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        table.validate()?;

        tracing::info!(
            version = table.version,
            tiers = table.tiers.len(),
            actions = table.costs.len(),
            "Tier configuration loaded"
        );
        Ok(table)
    }

    pub fn from_json(raw: &str) -> CreditResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| CreditError::Config(format!("Invalid tier config: {}", e)))
    }

    /// Reject tables the engine cannot reason about
    pub fn validate(&self) -> CreditResult<()> {
        if self.version == 0 {
            return Err(CreditError::Config("version must be >= 1".into()));
        }

        let expected: Vec<LtdTier> = LtdTier::all().collect();
        let actual: Vec<LtdTier> = self.tiers.iter().map(|entry| entry.tier).collect();
        if actual != expected {
            return Err(CreditError::Config(format!(
                "tiers must be numbered 1..={} in order",
                LtdTier::MAX.get()
            )));
        }

        for plan in [&self.free, &self.pro] {
            if plan.monthly_credits < 0 {
                return Err(CreditError::Config(format!(
                    "{} has negative monthly credits",
                    plan.name
                )));
            }
        }

        let mut previous = 0;
        for entry in &self.tiers {
            if entry.config.monthly_credits < previous {
                return Err(CreditError::Config(format!(
                    "{} allots fewer credits than the tier below it",
                    entry.tier
                )));
            }
            previous = entry.config.monthly_credits;
        }

        for (action, cost) in &self.costs {
            if cost.base_cost < 0 || cost.tier_overrides.values().any(|c| *c < 0) {
                return Err(CreditError::Config(format!(
                    "action {} has a negative cost",
                    action
                )));
            }
            if let Some(bad) = cost.tier_overrides.keys().find(|t| LtdTier::new(**t).is_err()) {
                return Err(CreditError::Config(format!(
                    "action {} overrides unknown tier {}",
                    action, bad
                )));
            }
        }

        Ok(())
    }

    /// Configuration for an LTD tier
    pub fn tier(&self, tier: LtdTier) -> CreditResult<&PlanConfig> {
        self.tiers
            .iter()
            .find(|entry| entry.tier == tier)
            .map(|entry| &entry.config)
            .ok_or_else(|| CreditError::Config(format!("{} is not configured", tier)))
    }

    /// Resolve any plan to its configuration
    pub fn plan(&self, plan_type: PlanType, tier: Option<LtdTier>) -> CreditResult<&PlanConfig> {
        match (plan_type, tier) {
            (PlanType::Free, _) => Ok(&self.free),
            (PlanType::Pro, _) => Ok(&self.pro),
            (PlanType::Ltd, Some(tier)) => self.tier(tier),
            (PlanType::Ltd, None) => Err(CreditError::IntegrityViolation(
                "LTD plan without a tier".into(),
            )),
        }
    }

    /// Monthly allotment a tier grants
    pub fn monthly_credits(&self, tier: LtdTier) -> CreditResult<i64> {
        Ok(self.tier(tier)?.monthly_credits)
    }

    /// Lowest LTD tier whose features include `feature`
    pub fn min_tier_for(&self, feature: Feature) -> Option<LtdTier> {
        self.tiers
            .iter()
            .find(|entry| entry.config.features.grants(feature))
            .map(|entry| entry.tier)
    }

    pub fn action(&self, action: &str) -> CreditResult<&ActionCost> {
        self.costs
            .get(action)
            .ok_or_else(|| CreditError::InvalidInput(format!("Unknown action: {}", action)))
    }

    /// Credits charged for `action` at `tier` (base cost for non-LTD plans)
    pub fn calculate_credit_cost(&self, action: &str, tier: Option<LtdTier>) -> CreditResult<i64> {
        Ok(self.action(action)?.cost_for(tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(n: u8) -> LtdTier {
        LtdTier::new(n).unwrap()
    }

    #[test]
    fn test_default_table_is_valid() {
        let table = TierTable::default();
        table.validate().unwrap();
        assert_eq!(table.tiers.len(), 5);
    }

    #[test]
    fn test_monthly_allotments() {
        let table = TierTable::default();
        assert_eq!(table.monthly_credits(tier(1)).unwrap(), 100);
        assert_eq!(table.monthly_credits(tier(2)).unwrap(), 300);
        assert_eq!(table.monthly_credits(tier(3)).unwrap(), 750);
        assert_eq!(table.monthly_credits(tier(4)).unwrap(), 2000);
        assert_eq!(table.free.monthly_credits, 10);
        assert_eq!(table.pro.monthly_credits, 1000);
    }

    #[test]
    fn test_scheduling_caps_by_tier() {
        let table = TierTable::default();
        let cap = |n| table.tier(tier(n)).unwrap().features.scheduling;
        assert_eq!(cap(1), Limit::Capped(0));
        assert_eq!(cap(2), Limit::Capped(30));
        assert_eq!(cap(3), Limit::Capped(100));
        assert_eq!(cap(4), Limit::Unlimited);
    }

    #[test]
    fn test_min_tier_for_feature() {
        let table = TierTable::default();
        assert_eq!(
            table.min_tier_for(Feature::ContentRepurposing),
            Some(tier(1))
        );
        assert_eq!(table.min_tier_for(Feature::Scheduling), Some(tier(2)));
        assert_eq!(table.min_tier_for(Feature::AiChat), Some(tier(3)));
        assert_eq!(table.min_tier_for(Feature::ApiAccess), Some(tier(4)));
    }

    #[test]
    fn test_rollover_cap_is_months_of_limit() {
        let table = TierTable::default();
        assert_eq!(table.tier(tier(2)).unwrap().rollover_cap(300), 3600);
        assert_eq!(table.free.rollover_cap(10), 0);
    }

    #[test]
    fn test_cost_uses_tier_override() {
        let mut table = TierTable::default();
        table
            .costs
            .get_mut("ai_chat_conversation")
            .unwrap()
            .tier_overrides
            .insert(4, 0);

        let cost = |t: Option<LtdTier>| table.calculate_credit_cost("ai_chat_conversation", t);
        assert_eq!(cost(Some(tier(3))).unwrap(), 1);
        assert_eq!(cost(Some(tier(4))).unwrap(), 0);
        assert_eq!(cost(None).unwrap(), 1);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let table = TierTable::default();
        let err = table.calculate_credit_cost("teleport", Some(tier(1))).unwrap_err();
        assert!(matches!(err, CreditError::InvalidInput(_)));
    }

    #[test]
    fn test_ltd_plan_requires_tier() {
        let table = TierTable::default();
        assert!(table.plan(PlanType::Ltd, None).is_err());
        assert_eq!(table.plan(PlanType::Pro, None).unwrap().name, "Pro");
    }

    #[test]
    fn test_validate_rejects_missing_tier() {
        let mut table = TierTable::default();
        table.tiers.pop();
        assert!(matches!(table.validate(), Err(CreditError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_decreasing_allotment() {
        let mut table = TierTable::default();
        table.tiers[2].config.monthly_credits = 50;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_cost() {
        let mut table = TierTable::default();
        table.costs.get_mut("viral_hook").unwrap().base_cost = -1;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_table_json_round_trip_keeps_unlimited() {
        let table = TierTable::default();
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.contains("\"unlimited\""));
        let parsed = TierTable::from_json(&json).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_limit_allows() {
        assert!(Limit::Capped(30).allows(29, 1));
        assert!(!Limit::Capped(30).allows(30, 1));
        assert!(Limit::Unlimited.allows(i64::MAX, 1));
        assert!(!Limit::Capped(0).is_enabled());
    }

    #[test]
    fn test_feature_parsing() {
        assert_eq!(" AI_Chat ".parse::<Feature>().unwrap(), Feature::AiChat);
        assert!("teleport".parse::<Feature>().is_err());
        assert_eq!(
            "chat".parse::<CounterFeature>().unwrap(),
            CounterFeature::Chat
        );
    }
}
