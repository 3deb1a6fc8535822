//! Common types used across Repurpose

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{SharedError, SharedResult};

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Plan family a user account belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    #[default]
    Free,
    Pro,
    Ltd,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Ltd => "ltd",
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "ltd" => Ok(Self::Ltd),
            _ => Err(SharedError::Validation(format!("Invalid plan type: {}", s))),
        }
    }
}

/// Lifetime-deal tier, an ordinal level from 1 to 5.
///
/// Codes can only grant tiers 1 through 4; tier 5 is assigned by administrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LtdTier(u8);

impl LtdTier {
    pub const MIN: LtdTier = LtdTier(1);
    pub const MAX: LtdTier = LtdTier(5);
    /// Highest tier a redemption code may carry
    pub const MAX_CODE_TIER: LtdTier = LtdTier(4);

    pub fn new(value: u8) -> SharedResult<Self> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SharedError::Validation(format!(
                "Tier must be between {} and {}, got {}",
                Self::MIN.0,
                Self::MAX.0,
                value
            )))
        }
    }

    /// Validate a tier for code generation (1..=4)
    pub fn for_code(value: i32) -> SharedResult<Self> {
        if !(1..=Self::MAX_CODE_TIER.0 as i32).contains(&value) {
            return Err(SharedError::Validation(format!(
                "Code tier must be between 1 and {}, got {}",
                Self::MAX_CODE_TIER.0,
                value
            )));
        }
        Self::new(value as u8)
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// All tiers in ascending order
    pub fn all() -> impl Iterator<Item = LtdTier> {
        (Self::MIN.0..=Self::MAX.0).map(LtdTier)
    }
}

impl TryFrom<u8> for LtdTier {
    type Error = SharedError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<i32> for LtdTier {
    type Error = SharedError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| SharedError::Validation(format!("Tier out of range: {}", value)))
            .and_then(Self::new)
    }
}

impl From<LtdTier> for u8 {
    fn from(tier: LtdTier) -> Self {
        tier.0
    }
}

impl From<LtdTier> for i32 {
    fn from(tier: LtdTier) -> Self {
        tier.0 as i32
    }
}

impl std::fmt::Display for LtdTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tier {}", self.0)
    }
}

// =============================================================================
// Calendar helpers
// =============================================================================

/// Month key used by monthly usage counters, e.g. "2025-10"
pub fn month_year(at: OffsetDateTime) -> String {
    format!("{:04}-{:02}", at.year(), u8::from(at.month()))
}

/// Add calendar months, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29)
pub fn add_months(at: OffsetDateTime, months: u32) -> SharedResult<OffsetDateTime> {
    let month_index = u8::from(at.month()) as u32 - 1 + months;
    let year = i32::try_from(month_index / 12)
        .ok()
        .and_then(|years| at.year().checked_add(years))
        .ok_or_else(|| SharedError::DateOutOfRange(format!("{} + {} months", at, months)))?;
    let month: Month = at.month().nth_next((months % 12) as u8);
    let day = at.day().min(month.length(year));

    let date = Date::from_calendar_date(year, month, day)
        .map_err(|e| SharedError::DateOutOfRange(e.to_string()))?;
    Ok(at.replace_date(date))
}

/// First monthly anniversary of `anchor` strictly after `now`.
///
/// Anniversaries are always computed from the anchor so clamped short months
/// do not drift the day of month.
pub fn next_reset_after(
    anchor: OffsetDateTime,
    now: OffsetDateTime,
) -> SharedResult<OffsetDateTime> {
    let elapsed_months = (now.year() as i64 - anchor.year() as i64) * 12
        + (u8::from(now.month()) as i64 - u8::from(anchor.month()) as i64);
    let mut months = elapsed_months.max(1) as u32;

    loop {
        let candidate = add_months(anchor, months)?;
        if candidate > now {
            return Ok(candidate);
        }
        months += 1;
    }
}
