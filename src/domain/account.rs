//! Ledger account entity.
//!
//! One account per user. Every balance mutation goes through the methods on
//! [`Account`] so that running totals and limit counters move together.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::tier::VerificationTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    PendingVerification,
    Active,
    Suspended,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::PendingVerification => "PENDING_VERIFICATION",
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Suspended => "SUSPENDED",
            AccountStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_VERIFICATION" => Ok(Self::PendingVerification),
            "ACTIVE" => Ok(Self::Active),
            "SUSPENDED" => Ok(Self::Suspended),
            "CLOSED" => Ok(Self::Closed),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub account_number: String,
    pub user_id: Uuid,
    pub account_name: String,
    pub balance: BigDecimal,
    pub currency: String,
    pub status: AccountStatus,
    pub verification_tier: VerificationTier,

    pub daily_limit: BigDecimal,
    pub monthly_limit: BigDecimal,
    pub daily_spent: BigDecimal,
    pub monthly_spent: BigDecimal,
    pub last_daily_reset: DateTime<Utc>,
    pub last_monthly_reset: DateTime<Utc>,

    pub failed_transaction_count: i32,
    pub frozen: bool,
    pub freeze_reason: Option<String>,
    pub freeze_expires_at: Option<DateTime<Utc>>,
    pub last_transaction_ip: Option<String>,
    pub last_login_ip: Option<String>,

    pub total_deposits: BigDecimal,
    pub total_withdrawals: BigDecimal,
    /// Finalized attempts, completed or failed.
    pub transaction_count: i64,
    pub successful_transaction_count: i64,
    pub last_transaction_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn open(
        user_id: Uuid,
        account_number: String,
        account_name: String,
        currency: String,
        tier: VerificationTier,
        now: DateTime<Utc>,
    ) -> Self {
        let limits = tier.limits();
        Self {
            id: Uuid::new_v4(),
            account_number,
            user_id,
            account_name,
            balance: BigDecimal::zero(),
            currency,
            status: AccountStatus::Active,
            verification_tier: tier,
            daily_limit: limits.daily,
            monthly_limit: limits.monthly,
            daily_spent: BigDecimal::zero(),
            monthly_spent: BigDecimal::zero(),
            last_daily_reset: now,
            last_monthly_reset: now,
            failed_transaction_count: 0,
            frozen: false,
            freeze_reason: None,
            freeze_expires_at: None,
            last_transaction_ip: None,
            last_login_ip: None,
            total_deposits: BigDecimal::zero(),
            total_withdrawals: BigDecimal::zero(),
            transaction_count: 0,
            successful_transaction_count: 0,
            last_transaction_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// A freeze without an expiry never lapses on its own.
    pub fn is_freeze_expired(&self, now: DateTime<Utc>) -> bool {
        self.frozen && self.freeze_expires_at.map_or(false, |until| until <= now)
    }

    pub fn freeze(&mut self, reason: impl Into<String>, until: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.frozen = true;
        self.freeze_reason = Some(reason.into());
        self.freeze_expires_at = until;
        self.updated_at = now;
    }

    pub fn unfreeze(&mut self, now: DateTime<Utc>) {
        self.frozen = false;
        self.freeze_reason = None;
        self.freeze_expires_at = None;
        self.updated_at = now;
    }

    pub fn needs_daily_reset(&self, now: DateTime<Utc>) -> bool {
        self.last_daily_reset.date_naive() < now.date_naive()
    }

    pub fn needs_monthly_reset(&self, now: DateTime<Utc>) -> bool {
        (self.last_monthly_reset.year(), self.last_monthly_reset.month()) < (now.year(), now.month())
    }

    /// Zeroes the spend counters whose window boundary has passed. Returns
    /// whether anything changed.
    pub fn roll_limit_windows(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.needs_daily_reset(now) {
            self.daily_spent = BigDecimal::zero();
            self.last_daily_reset = now;
            changed = true;
        }
        if self.needs_monthly_reset(now) {
            self.monthly_spent = BigDecimal::zero();
            self.last_monthly_reset = now;
            changed = true;
        }
        if changed {
            self.updated_at = now;
        }
        changed
    }

    pub fn remaining_daily_limit(&self) -> BigDecimal {
        let remaining = &self.daily_limit - &self.daily_spent;
        if remaining < BigDecimal::zero() {
            BigDecimal::zero()
        } else {
            remaining
        }
    }

    pub fn remaining_monthly_limit(&self) -> BigDecimal {
        let remaining = &self.monthly_limit - &self.monthly_spent;
        if remaining < BigDecimal::zero() {
            BigDecimal::zero()
        } else {
            remaining
        }
    }

    pub fn apply_deposit(&mut self, amount: &BigDecimal, ip: Option<&str>, now: DateTime<Utc>) {
        self.balance = &self.balance + amount;
        self.total_deposits = &self.total_deposits + amount;
        self.record_success(amount, ip, now);
    }

    /// Caller guarantees `amount <= balance`.
    pub fn apply_debit(&mut self, amount: &BigDecimal, ip: Option<&str>, now: DateTime<Utc>) {
        self.balance = &self.balance - amount;
        self.total_withdrawals = &self.total_withdrawals + amount;
        self.record_success(amount, ip, now);
    }

    fn record_success(&mut self, amount: &BigDecimal, ip: Option<&str>, now: DateTime<Utc>) {
        self.daily_spent = &self.daily_spent + amount;
        self.monthly_spent = &self.monthly_spent + amount;
        self.transaction_count += 1;
        self.successful_transaction_count += 1;
        self.failed_transaction_count = 0;
        if let Some(ip) = ip {
            self.last_transaction_ip = Some(ip.to_string());
        }
        self.last_transaction_at = Some(now);
        self.updated_at = now;
    }

    pub fn record_failed_attempt(&mut self, now: DateTime<Utc>) {
        self.failed_transaction_count += 1;
        self.transaction_count += 1;
        self.updated_at = now;
    }

    pub fn success_ratio(&self) -> Option<f64> {
        if self.transaction_count == 0 {
            None
        } else {
            Some(self.successful_transaction_count as f64 / self.transaction_count as f64)
        }
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;

    fn account_at(now: DateTime<Utc>) -> Account {
        Account::open(
            Uuid::new_v4(),
            "ACC0000000001".to_string(),
            "Primary".to_string(),
            "USD".to_string(),
            VerificationTier::Basic,
            now,
        )
    }

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_open_uses_tier_limits() {
        let now = Utc::now();
        let account = account_at(now);
        assert_eq!(account.status, AccountStatus::Active);
        assert_eq!(account.daily_limit, dec("1000"));
        assert_eq!(account.monthly_limit, dec("10000"));
        assert_eq!(account.balance, BigDecimal::zero());
        assert_eq!(account.version, 0);
    }

    #[test]
    fn test_deposit_then_debit_keeps_totals_reconciled() {
        let now = Utc::now();
        let mut account = account_at(now);
        account.apply_deposit(&dec("100"), Some("10.0.0.1"), now);
        account.apply_debit(&dec("4.99"), Some("10.0.0.1"), now);

        assert_eq!(account.balance, dec("95.01"));
        assert_eq!(&account.total_deposits - &account.total_withdrawals, account.balance);
        assert_eq!(account.daily_spent, dec("104.99"));
        assert_eq!(account.transaction_count, 2);
        assert_eq!(account.successful_transaction_count, 2);
        assert_eq!(account.last_transaction_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_success_resets_failed_counter() {
        let now = Utc::now();
        let mut account = account_at(now);
        account.record_failed_attempt(now);
        account.record_failed_attempt(now);
        assert_eq!(account.failed_transaction_count, 2);
        assert_eq!(account.success_ratio(), Some(0.0));

        account.apply_deposit(&dec("10"), None, now);
        assert_eq!(account.failed_transaction_count, 0);
        assert_eq!(account.transaction_count, 3);
        assert!(account.last_transaction_ip.is_none());
    }

    #[test]
    fn test_roll_limit_windows() {
        let yesterday = Utc.with_ymd_and_hms(2026, 3, 14, 23, 0, 0).unwrap();
        let today = Utc.with_ymd_and_hms(2026, 3, 15, 8, 0, 0).unwrap();
        let mut account = account_at(yesterday);
        account.apply_deposit(&dec("250"), None, yesterday);

        assert!(account.roll_limit_windows(today));
        assert_eq!(account.daily_spent, BigDecimal::zero());
        // same month, monthly counter survives
        assert_eq!(account.monthly_spent, dec("250"));
        assert!(!account.roll_limit_windows(today));

        let next_month = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 1).unwrap();
        assert!(account.roll_limit_windows(next_month));
        assert_eq!(account.monthly_spent, BigDecimal::zero());
    }

    #[test]
    fn test_freeze_expiry() {
        let now = Utc::now();
        let mut account = account_at(now);
        account.freeze("manual review", Some(now + Duration::hours(1)), now);
        assert!(!account.is_freeze_expired(now));
        assert!(account.is_freeze_expired(now + Duration::hours(1)));

        account.freeze("indefinite", None, now);
        assert!(!account.is_freeze_expired(now + Duration::days(365)));

        account.unfreeze(now);
        assert!(!account.frozen);
        assert!(account.freeze_reason.is_none());
    }

    #[test]
    fn test_remaining_limits_never_negative() {
        let now = Utc::now();
        let mut account = account_at(now);
        account.daily_spent = dec("1200");
        assert_eq!(account.remaining_daily_limit(), BigDecimal::zero());
        // monthly counter untouched
        assert_eq!(account.remaining_monthly_limit(), dec("10000"));

        account.monthly_spent = dec("10500");
        assert_eq!(account.remaining_monthly_limit(), BigDecimal::zero());
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            AccountStatus::PendingVerification,
            AccountStatus::Active,
            AccountStatus::Suspended,
            AccountStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<AccountStatus>().unwrap(), status);
        }
    }
}
