//! Account Store operations.
//!
//! Wraps the raw store with the account lifecycle rules: one account per
//! user, banned users rejected, lazy unfreeze and limit-window roll on read,
//! and version-checked saves.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LedgerPolicy;
use crate::domain::{Account, AccountStatus, Transaction, TransactionStatus, VerificationTier};
use crate::error::{LedgerError, Result};
use crate::ports::LedgerStore;
use crate::services::ids::{unique_account_number, IdGenerator};

/// How many times a transaction may be resubmitted after failing.
pub const MAX_RETRIES: i32 = 3;

const READ_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatistics {
    pub account_number: String,
    pub status: AccountStatus,
    pub verification_tier: VerificationTier,
    pub currency: String,
    pub balance: BigDecimal,
    pub total_deposits: BigDecimal,
    pub total_withdrawals: BigDecimal,
    pub transaction_count: i64,
    pub successful_transaction_count: i64,
    pub success_rate: Option<f64>,
    pub daily_remaining: BigDecimal,
    pub monthly_remaining: BigDecimal,
    pub frozen: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

pub struct AccountService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: LedgerPolicy,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            policy,
        }
    }

    pub async fn create(&self, user_id: Uuid, account_name: &str, currency: &str) -> Result<Account> {
        let account_name = account_name.trim();
        if account_name.is_empty() || account_name.len() > 100 {
            return Err(LedgerError::Validation(
                "account name must be between 1 and 100 characters".to_string(),
            ));
        }
        let currency = normalize_currency(currency)?;

        if self.store.is_user_banned(user_id).await? {
            warn!("Rejected account creation for banned user {}", user_id);
            return Err(LedgerError::PolicyViolation(format!(
                "user {} is banned and cannot open an account",
                user_id
            )));
        }
        if self.store.find_account_by_user(user_id).await?.is_some() {
            return Err(LedgerError::DuplicateAccount { user_id });
        }

        let account_number = unique_account_number(&*self.store, &*self.ids).await?;
        let account = Account::open(
            user_id,
            account_number,
            account_name.to_string(),
            currency,
            self.policy.default_verification_tier,
            self.clock.now(),
        );
        self.store.insert_account(&account).await?;

        info!(
            "Opened account {} for user {} ({} tier)",
            account.account_number, user_id, account.verification_tier
        );
        Ok(account)
    }

    /// The user's account, refreshed: an elapsed freeze is lifted and spent
    /// counters from a past window are zeroed, both persisted before return.
    pub async fn get_active_for_user(&self, user_id: Uuid) -> Result<Account> {
        for _ in 0..READ_ATTEMPTS {
            let mut account = self.find_open(user_id).await?;
            let now = self.clock.now();

            let mut dirty = false;
            if account.is_freeze_expired(now) {
                info!("Freeze on account {} expired, lifting it", account.account_number);
                account.unfreeze(now);
                dirty = true;
            }
            if account.roll_limit_windows(now) {
                dirty = true;
            }
            if !dirty {
                return Ok(account);
            }

            match self.store.update_account(&account).await {
                Ok(stored) => return Ok(stored),
                // someone else refreshed it first; read again
                Err(LedgerError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Conflict(format!(
            "account for user {} kept changing while being read",
            user_id
        )))
    }

    async fn find_open(&self, user_id: Uuid) -> Result<Account> {
        match self.store.find_account_by_user(user_id).await? {
            Some(account) if account.status != AccountStatus::Closed => Ok(account),
            _ => Err(LedgerError::NotFound(format!("no active account for user {}", user_id))),
        }
    }

    /// Version-checked write; fails with `Conflict` if `account` is stale.
    pub async fn save(&self, account: &Account) -> Result<Account> {
        self.store.update_account(account).await
    }

    /// `duration` of `None` freezes until an explicit unfreeze.
    pub async fn freeze(&self, user_id: Uuid, reason: &str, duration: Option<Duration>) -> Result<Account> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation("freeze reason is required".to_string()));
        }
        let mut account = self.get_active_for_user(user_id).await?;
        let now = self.clock.now();
        account.freeze(reason.trim(), duration.map(|d| now + d), now);
        let stored = self.save(&account).await?;
        warn!(
            "Account {} frozen until {:?}: {}",
            stored.account_number, stored.freeze_expires_at, reason
        );
        Ok(stored)
    }

    pub async fn unfreeze(&self, user_id: Uuid) -> Result<Account> {
        let mut account = self.get_active_for_user(user_id).await?;
        if !account.frozen {
            return Ok(account);
        }
        account.unfreeze(self.clock.now());
        let stored = self.save(&account).await?;
        info!("Account {} unfrozen", stored.account_number);
        Ok(stored)
    }

    /// Closing requires an empty balance; the record is kept with status CLOSED.
    pub async fn close(&self, user_id: Uuid) -> Result<Account> {
        let mut account = self.get_active_for_user(user_id).await?;
        if !account.balance.is_zero() {
            return Err(LedgerError::PolicyViolation(format!(
                "account {} still holds {} {}",
                account.account_number, account.balance, account.currency
            )));
        }
        let now = self.clock.now();
        account.status = AccountStatus::Closed;
        account.closed_at = Some(now);
        account.updated_at = now;
        let stored = self.save(&account).await?;
        info!("Account {} closed", stored.account_number);
        Ok(stored)
    }

    pub async fn statistics(&self, user_id: Uuid) -> Result<AccountStatistics> {
        let account = self.get_active_for_user(user_id).await?;
        Ok(AccountStatistics {
            success_rate: account.success_ratio(),
            daily_remaining: account.remaining_daily_limit(),
            monthly_remaining: account.remaining_monthly_limit(),
            account_number: account.account_number,
            status: account.status,
            verification_tier: account.verification_tier,
            currency: account.currency,
            balance: account.balance,
            total_deposits: account.total_deposits,
            total_withdrawals: account.total_withdrawals,
            transaction_count: account.transaction_count,
            successful_transaction_count: account.successful_transaction_count,
            frozen: account.frozen,
            last_activity: account.last_transaction_at,
        })
    }

    /// Newest first.
    pub async fn history(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let account = self.get_active_for_user(user_id).await?;
        self.store.list_transactions_for_account(account.id).await
    }

    /// FAILED transactions that were not blocked by fraud screening, are still
    /// inside the expiry window and have retries left.
    pub async fn retry_eligible(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let cutoff = self.clock.now() - self.policy.failed_tx_expiry;
        Ok(self
            .history(user_id)
            .await?
            .into_iter()
            .filter(|t| {
                t.status == TransactionStatus::Failed
                    && t.fraud_check_passed != Some(false)
                    && t.retry_count < MAX_RETRIES
                    && t.failed_at.unwrap_or(t.updated_at) >= cutoff
            })
            .collect())
    }
}

fn normalize_currency(currency: &str) -> Result<String> {
    let code = currency.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(LedgerError::Validation(format!(
            "currency must be a 3-letter ISO 4217 code, got {:?}",
            currency
        )));
    }
    Ok(code)
}
