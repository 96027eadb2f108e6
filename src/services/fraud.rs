//! Fraud Risk Engine.
//!
//! Scores a proposed transaction from 0 to 100 across seven capped
//! categories. The scoring itself is pure over a [`ScoringInput`]; `assess`
//! loads the account's recent history and fails closed if it cannot.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::domain::{
    Account, AccountStatus, FraudAssessment, RiskAnalysis, RiskCategory, RiskFactor, RiskTier, Transaction,
    TransactionStatus,
};
use crate::ports::TransactionStore;

/// Score boundaries and the pass threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudPolicy {
    /// Scores strictly below this pass.
    pub pass_threshold: i32,
    pub medium_from: i32,
    pub high_from: i32,
    pub critical_from: i32,
    /// UTC hours `[start, end)` treated as off-hours.
    pub off_hours_start: u32,
    pub off_hours_end: u32,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            pass_threshold: 70,
            medium_from: 25,
            high_from: 50,
            critical_from: 80,
            off_hours_start: 0,
            off_hours_end: 5,
        }
    }
}

impl FraudPolicy {
    pub fn tier_for(&self, score: i32) -> RiskTier {
        if score >= self.critical_from {
            RiskTier::Critical
        } else if score >= self.high_from {
            RiskTier::High
        } else if score >= self.medium_from {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    fn is_off_hours(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        if self.off_hours_start <= self.off_hours_end {
            hour >= self.off_hours_start && hour < self.off_hours_end
        } else {
            // window wraps midnight
            hour >= self.off_hours_start || hour < self.off_hours_end
        }
    }
}

/// Everything the scoring rules look at.
pub struct ScoringInput<'a> {
    pub transaction: &'a Transaction,
    pub account: &'a Account,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    /// The account's transactions from the trailing 24 hours, any status.
    pub history: &'a [Transaction],
    pub now: DateTime<Utc>,
}

struct Category {
    category: RiskCategory,
    cap: i32,
    factors: Vec<RiskFactor>,
}

impl Category {
    fn new(category: RiskCategory, cap: i32) -> Self {
        Self {
            category,
            cap,
            factors: Vec::new(),
        }
    }

    fn add(&mut self, points: i32, rationale: impl Into<String>) {
        self.factors.push(RiskFactor {
            category: self.category,
            points,
            rationale: rationale.into(),
        });
    }

    fn subtotal(&self) -> i32 {
        self.factors.iter().map(|f| f.points).sum::<i32>().min(self.cap)
    }
}

pub struct FraudRiskEngine {
    transactions: Arc<dyn TransactionStore>,
    clock: Arc<dyn Clock>,
    policy: FraudPolicy,
}

impl FraudRiskEngine {
    pub fn new(transactions: Arc<dyn TransactionStore>, clock: Arc<dyn Clock>, policy: FraudPolicy) -> Self {
        Self {
            transactions,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &FraudPolicy {
        &self.policy
    }

    /// Scores `transaction` against `account`. Never errors: anything that
    /// stops the evaluation produces a blocking CRITICAL verdict.
    pub async fn assess(
        &self,
        transaction: &Transaction,
        account: &Account,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> FraudAssessment {
        let now = self.clock.now();

        let history = match self
            .transactions
            .list_transactions_since(account.id, now - Duration::hours(24))
            .await
        {
            Ok(history) => history,
            Err(e) => {
                error!(
                    "Risk history unavailable for account {} (transaction {}): {}",
                    account.id, transaction.id, e
                );
                return self.fail_closed(format!("risk evaluation unavailable: {}", e), now);
            }
        };

        let assessment = self.score(&ScoringInput {
            transaction,
            account,
            ip_address,
            user_agent,
            history: &history,
            now,
        });

        if assessment.passed {
            debug!(
                "Transaction {} scored {} ({})",
                transaction.id, assessment.risk_score, assessment.risk_tier
            );
        } else {
            warn!(
                "Transaction {} blocked: score {} ({})",
                transaction.id, assessment.risk_score, assessment.risk_tier
            );
        }

        assessment
    }

    pub fn fail_closed(&self, reason: String, now: DateTime<Utc>) -> FraudAssessment {
        FraudAssessment {
            risk_score: 100,
            risk_tier: RiskTier::Critical,
            passed: false,
            reason: Some(reason),
            analysis: RiskAnalysis {
                evaluated_at: now,
                subtotals: Vec::new(),
                factors: Vec::new(),
                fail_closed: true,
            },
        }
    }

    pub fn score(&self, input: &ScoringInput<'_>) -> FraudAssessment {
        let categories = [
            amount_risk(input),
            velocity_risk(input),
            behavioral_risk(input),
            network_risk(input),
            self.temporal_risk(input),
            account_state_risk(input),
            pattern_risk(input),
        ];

        let subtotals: Vec<(RiskCategory, i32)> = categories.iter().map(|c| (c.category, c.subtotal())).collect();
        let risk_score = subtotals.iter().map(|(_, points)| points).sum::<i32>().min(100);
        let risk_tier = self.policy.tier_for(risk_score);
        let passed = risk_score < self.policy.pass_threshold;

        let factors: Vec<RiskFactor> = categories.into_iter().flat_map(|c| c.factors).collect();

        let reason = if passed {
            None
        } else {
            let mut top: Vec<&RiskFactor> = factors.iter().collect();
            top.sort_by(|a, b| b.points.cmp(&a.points));
            let summary: Vec<&str> = top.iter().take(3).map(|f| f.rationale.as_str()).collect();
            Some(format!(
                "risk score {} ({}) at or above threshold {}: {}",
                risk_score,
                risk_tier,
                self.policy.pass_threshold,
                summary.join("; ")
            ))
        };

        FraudAssessment {
            risk_score,
            risk_tier,
            passed,
            reason,
            analysis: RiskAnalysis {
                evaluated_at: input.now,
                subtotals,
                factors,
                fail_closed: false,
            },
        }
    }

    fn temporal_risk(&self, input: &ScoringInput<'_>) -> Category {
        let mut risk = Category::new(RiskCategory::Temporal, 10);
        if self.policy.is_off_hours(input.now) {
            risk.add(5, "submitted during off-hours");
        }
        if matches!(input.now.weekday(), Weekday::Sat | Weekday::Sun) {
            risk.add(5, "submitted on a weekend");
        }
        risk
    }
}

/// Other transactions in the history, i.e. excluding the one being scored.
fn others<'a>(input: &'a ScoringInput<'_>) -> impl Iterator<Item = &'a Transaction> + 'a {
    let current: &'a str = input.transaction.id.as_str();
    let history: &'a [Transaction] = input.history;
    history.iter().filter(move |t| t.id != current)
}

fn amount_risk(input: &ScoringInput<'_>) -> Category {
    let mut risk = Category::new(RiskCategory::Amount, 40);
    let amount = &input.transaction.amount;

    if *amount > BigDecimal::from(1_000) {
        risk.add(20, "amount above 1,000");
    }
    if *amount > BigDecimal::from(5_000) {
        risk.add(20, "amount above 5,000");
    }

    let whole = amount.with_scale(0);
    let is_round = whole == *amount && whole.to_i64().map_or(false, |n| n % 100 == 0);
    if is_round && *amount >= BigDecimal::from(500) {
        risk.add(5, "round amount");
    }
    risk
}

fn velocity_risk(input: &ScoringInput<'_>) -> Category {
    let mut risk = Category::new(RiskCategory::Velocity, 40);
    let hour_ago = input.now - Duration::hours(1);

    let completed: Vec<&Transaction> = others(input)
        .filter(|t| t.status == TransactionStatus::Completed)
        .collect();

    let hour_volume = completed
        .iter()
        .filter(|t| t.created_at >= hour_ago)
        .fold(BigDecimal::zero(), |acc, t| acc + &t.amount);
    let day_volume = completed.iter().fold(BigDecimal::zero(), |acc, t| acc + &t.amount);

    if hour_volume > BigDecimal::from(500) {
        risk.add(15, format!("completed volume {} in the last hour", hour_volume));
    }
    if day_volume > BigDecimal::from(2_000) {
        risk.add(20, format!("completed volume {} in the last 24 hours", day_volume));
    }

    let hour_count = completed.iter().filter(|t| t.created_at >= hour_ago).count();
    if hour_count >= 3 {
        risk.add(15, format!("{} completed transactions in the last hour", hour_count));
    }

    let day_count = completed.len();
    if day_count >= 10 {
        risk.add(20, format!("{} completed transactions in the last 24 hours", day_count));
    } else if day_count >= 5 {
        risk.add(10, format!("{} completed transactions in the last 24 hours", day_count));
    }
    risk
}

fn behavioral_risk(input: &ScoringInput<'_>) -> Category {
    let mut risk = Category::new(RiskCategory::Behavioral, 30);
    let account = input.account;

    if account.failed_transaction_count > 0 {
        risk.add(
            account.failed_transaction_count.saturating_mul(10),
            format!("{} recent failed transactions", account.failed_transaction_count),
        );
    }
    if account.age_days(input.now) < 7 {
        risk.add(10, "account younger than 7 days");
    }
    if let Some(ratio) = account.success_ratio() {
        if ratio < 0.5 {
            risk.add(15, format!("success ratio {:.0}%", ratio * 100.0));
        }
    }
    risk
}

fn network_risk(input: &ScoringInput<'_>) -> Category {
    let mut risk = Category::new(RiskCategory::Network, 25);
    match input.ip_address {
        None => risk.add(10, "no IP address supplied"),
        Some(ip) => {
            if let Some(last) = input.account.last_transaction_ip.as_deref() {
                if last != ip {
                    risk.add(15, "IP address differs from the last transaction");
                }
            }
        }
    }
    if input.user_agent.map_or(false, |ua| ua.trim().is_empty()) {
        debug!("Blank user agent on transaction {}", input.transaction.id);
    }
    risk
}

fn account_state_risk(input: &ScoringInput<'_>) -> Category {
    let mut risk = Category::new(RiskCategory::AccountState, 100);
    let account = input.account;

    if account.frozen {
        risk.add(100, "account is frozen");
    }
    if account.status != AccountStatus::Active {
        risk.add(50, format!("account status {}", account.status));
    }
    if account.verification_tier.is_lowest() {
        risk.add(5, "lowest verification tier");
    }
    risk
}

fn pattern_risk(input: &ScoringInput<'_>) -> Category {
    let mut risk = Category::new(RiskCategory::Pattern, 45);
    let hour_ago = input.now - Duration::hours(1);

    let last_hour = others(input).filter(|t| t.created_at >= hour_ago).count();
    if last_hour >= 3 {
        risk.add(25, format!("{} other transactions in the last hour", last_hour));
    }

    let same_amount = others(input)
        .filter(|t| t.amount == input.transaction.amount)
        .count();
    if same_amount >= 2 {
        risk.add(20, format!("{} recent transactions with the same amount", same_amount));
    }
    risk
}
