//! Verification tiers and the spending limits attached to them.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bumped whenever the limit table below changes.
pub const TIER_LIMITS_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationTier {
    Basic,
    Standard,
    Premium,
    Enterprise,
}

/// Fixed spending limits for one verification tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierLimits {
    pub daily: BigDecimal,
    pub monthly: BigDecimal,
    pub max_single_transaction: BigDecimal,
}

impl VerificationTier {
    pub const ALL: [VerificationTier; 4] = [
        VerificationTier::Basic,
        VerificationTier::Standard,
        VerificationTier::Premium,
        VerificationTier::Enterprise,
    ];

    pub fn limits(&self) -> TierLimits {
        let (daily, monthly, single): (i64, i64, i64) = match self {
            VerificationTier::Basic => (1_000, 10_000, 500),
            VerificationTier::Standard => (5_000, 50_000, 2_500),
            VerificationTier::Premium => (25_000, 250_000, 10_000),
            VerificationTier::Enterprise => (100_000, 1_000_000, 50_000),
        };

        TierLimits {
            daily: BigDecimal::from(daily),
            monthly: BigDecimal::from(monthly),
            max_single_transaction: BigDecimal::from(single),
        }
    }

    pub fn is_lowest(&self) -> bool {
        *self == VerificationTier::Basic
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationTier::Basic => "BASIC",
            VerificationTier::Standard => "STANDARD",
            VerificationTier::Premium => "PREMIUM",
            VerificationTier::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BASIC" => Ok(Self::Basic),
            "STANDARD" => Ok(Self::Standard),
            "PREMIUM" => Ok(Self::Premium),
            "ENTERPRISE" => Ok(Self::Enterprise),
            other => Err(format!("unknown verification tier: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_grow_with_tier() {
        let mut previous: Option<TierLimits> = None;
        for tier in VerificationTier::ALL {
            let limits = tier.limits();
            assert!(limits.max_single_transaction <= limits.daily);
            assert!(limits.daily <= limits.monthly);
            if let Some(prev) = previous {
                assert!(prev.daily < limits.daily);
                assert!(prev.monthly < limits.monthly);
            }
            previous = Some(limits);
        }
    }

    #[test]
    fn test_basic_tier_table() {
        let limits = VerificationTier::Basic.limits();
        assert_eq!(limits.daily, BigDecimal::from(1_000));
        assert_eq!(limits.monthly, BigDecimal::from(10_000));
        assert_eq!(limits.max_single_transaction, BigDecimal::from(500));
        assert!(VerificationTier::Basic.is_lowest());
        assert!(!VerificationTier::Premium.is_lowest());
    }

    #[test]
    fn test_parse_tier() {
        assert_eq!("premium".parse::<VerificationTier>().unwrap(), VerificationTier::Premium);
        assert_eq!(
            VerificationTier::Enterprise.to_string().parse::<VerificationTier>().unwrap(),
            VerificationTier::Enterprise
        );
        assert!("gold".parse::<VerificationTier>().is_err());
    }
}
