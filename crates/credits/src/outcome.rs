//! Business-rule rejection codes
//!
//! These are expected outcomes, not errors. They travel inside the outcome
//! types of each component so callers can present an upgrade or retry path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    InsufficientCredits,
    CodeInvalid,
    AlreadyRedeemed,
    /// Lost the race for the last redemption slot
    ConcurrentExhaustion,
    LimitExceeded,
    TierRestricted,
    UserNotFound,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientCredits => "INSUFFICIENT_CREDITS",
            RejectionReason::CodeInvalid => "CODE_INVALID",
            RejectionReason::AlreadyRedeemed => "ALREADY_REDEEMED",
            RejectionReason::ConcurrentExhaustion => "CONCURRENT_EXHAUSTION",
            RejectionReason::LimitExceeded => "LIMIT_EXCEEDED",
            RejectionReason::TierRestricted => "TIER_RESTRICTED",
            RejectionReason::UserNotFound => "USER_NOT_FOUND",
        }
    }

    /// The caller may reasonably try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectionReason::ConcurrentExhaustion)
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&RejectionReason::InsufficientCredits).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_CREDITS\"");
        assert_eq!(
            RejectionReason::ConcurrentExhaustion.to_string(),
            "CONCURRENT_EXHAUSTION"
        );
    }

    #[test]
    fn test_only_races_are_retryable() {
        assert!(RejectionReason::ConcurrentExhaustion.is_retryable());
        assert!(!RejectionReason::AlreadyRedeemed.is_retryable());
    }
}
