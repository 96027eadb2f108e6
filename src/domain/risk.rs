//! Fraud assessment types attached to transactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(RiskTier {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Critical => "CRITICAL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Amount,
    Velocity,
    Behavioral,
    Network,
    Temporal,
    AccountState,
    Pattern,
}

/// One rule that contributed points, with its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub category: RiskCategory,
    pub points: i32,
    pub rationale: String,
}

/// Structured breakdown stored alongside the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAnalysis {
    pub evaluated_at: DateTime<Utc>,
    /// Capped points per category.
    pub subtotals: Vec<(RiskCategory, i32)>,
    pub factors: Vec<RiskFactor>,
    /// Set when scoring could not complete and the verdict defaulted to block.
    pub fail_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAssessment {
    pub risk_score: i32,
    pub risk_tier: RiskTier,
    pub passed: bool,
    pub reason: Option<String>,
    pub analysis: RiskAnalysis,
}

impl FraudAssessment {
    pub fn subtotal(&self, category: RiskCategory) -> i32 {
        self.analysis
            .subtotals
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, points)| *points)
            .unwrap_or(0)
    }
}
