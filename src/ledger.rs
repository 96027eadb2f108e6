//! Entry point for collaborators.
//!
//! `Ledger` wires the services over one store and exposes the operations the
//! request layer calls. Callers pass an already-authenticated user id.

use bigdecimal::BigDecimal;
use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::LedgerPolicy;
use crate::domain::{
    credit_packages, Account, CreditPackage, PaymentMethod, TierLimits, Transaction, VerificationTier,
    CHAT_CREDIT_COST,
};
use crate::error::{LedgerError, Result};
use crate::ports::{LedgerStore, TransactionStore};
use crate::services::{
    AccountLocker, AccountService, AccountStatistics, CreditBalanceService, DepositRequest, FraudRiskEngine,
    IdGenerator, LocalAccountLocks, MaintenanceReport, MaintenanceScheduler, PurchaseRequest, RandomIds,
    RefillReport, RequestMetadata, TransactionProcessor,
};

pub struct LedgerBuilder {
    policy: LedgerPolicy,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    locks: Option<Arc<dyn AccountLocker>>,
}

impl LedgerBuilder {
    pub fn policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to in-process locks bounded by the policy's lock timeout.
    pub fn locks(mut self, locks: Arc<dyn AccountLocker>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build<S>(self, store: Arc<S>) -> Ledger
    where
        S: LedgerStore + 'static,
    {
        let policy = self.policy;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self.ids.unwrap_or_else(|| Arc::new(RandomIds));
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(LocalAccountLocks::new(policy.lock_timeout)));

        let history: Arc<dyn TransactionStore> = store.clone();
        let store: Arc<dyn LedgerStore> = store;

        let accounts = Arc::new(AccountService::new(store.clone(), clock.clone(), ids.clone(), policy.clone()));
        let credits = Arc::new(CreditBalanceService::new(store.clone()));
        let fraud = Arc::new(FraudRiskEngine::new(history, clock.clone(), policy.fraud.clone()));
        let maintenance = Arc::new(MaintenanceScheduler::new(store.clone(), clock.clone(), &policy));
        let processor = TransactionProcessor::new(
            store.clone(),
            accounts.clone(),
            credits.clone(),
            fraud,
            locks,
            clock,
            ids,
            policy,
        );

        Ledger {
            store,
            accounts,
            credits,
            processor,
            maintenance,
        }
    }
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    accounts: Arc<AccountService>,
    credits: Arc<CreditBalanceService>,
    processor: TransactionProcessor,
    maintenance: Arc<MaintenanceScheduler>,
}

impl Ledger {
    pub fn builder() -> LedgerBuilder {
        LedgerBuilder {
            policy: LedgerPolicy::default(),
            clock: None,
            ids: None,
            locks: None,
        }
    }

    pub fn credits(&self) -> Arc<CreditBalanceService> {
        self.credits.clone()
    }

    pub fn maintenance(&self) -> Arc<MaintenanceScheduler> {
        self.maintenance.clone()
    }

    pub async fn create_account(&self, user_id: Uuid, account_name: &str, currency: &str) -> Result<Account> {
        self.accounts.create(user_id, account_name, currency).await
    }

    pub async fn get_account(&self, user_id: Uuid) -> Result<Account> {
        self.accounts.get_active_for_user(user_id).await
    }

    pub async fn deposit(
        &self,
        user_id: Uuid,
        amount: BigDecimal,
        currency: &str,
        payment_method: PaymentMethod,
        description: Option<String>,
        metadata: RequestMetadata,
    ) -> Result<Transaction> {
        self.processor
            .deposit(DepositRequest {
                user_id,
                amount,
                currency: currency.to_string(),
                payment_method,
                description,
                metadata,
            })
            .await
    }

    pub async fn purchase_credits(
        &self,
        user_id: Uuid,
        package_id: &str,
        currency: &str,
        metadata: RequestMetadata,
    ) -> Result<Transaction> {
        self.processor
            .purchase_credits(PurchaseRequest {
                user_id,
                package_id: package_id.to_string(),
                currency: currency.to_string(),
                metadata,
            })
            .await
    }

    /// Newest first.
    pub async fn get_transaction_history(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        self.accounts.history(user_id).await
    }

    /// Only returns transactions that belong to `user_id`.
    pub async fn get_transaction(&self, user_id: Uuid, transaction_id: &str) -> Result<Transaction> {
        match self.store.get_transaction(transaction_id).await? {
            Some(tx) if tx.user_id == user_id => Ok(tx),
            _ => Err(LedgerError::NotFound(format!("transaction {}", transaction_id))),
        }
    }

    pub async fn get_account_statistics(&self, user_id: Uuid) -> Result<AccountStatistics> {
        self.accounts.statistics(user_id).await
    }

    pub async fn retry_eligible_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        self.accounts.retry_eligible(user_id).await
    }

    pub async fn freeze_account(&self, user_id: Uuid, reason: &str, duration: Option<Duration>) -> Result<Account> {
        self.accounts.freeze(user_id, reason, duration).await
    }

    pub async fn unfreeze_account(&self, user_id: Uuid) -> Result<Account> {
        self.accounts.unfreeze(user_id).await
    }

    pub async fn close_account(&self, user_id: Uuid) -> Result<Account> {
        self.accounts.close(user_id).await
    }

    pub fn list_credit_packages(&self) -> &'static [CreditPackage] {
        credit_packages()
    }

    pub fn verification_tiers(&self) -> Vec<(VerificationTier, TierLimits)> {
        VerificationTier::ALL.iter().map(|t| (*t, t.limits())).collect()
    }

    pub async fn get_credit_balance(&self, user_id: Uuid) -> Result<i64> {
        self.credits.get_balance(user_id).await
    }

    pub async fn has_credits_for_chat(&self, user_id: Uuid) -> Result<bool> {
        self.credits.has_enough_for(user_id, CHAT_CREDIT_COST).await
    }

    /// Returns the balance left after one chat interaction.
    pub async fn deduct_chat_credits(&self, user_id: Uuid) -> Result<i64> {
        self.credits.deduct(user_id, CHAT_CREDIT_COST).await
    }

    pub async fn add_credits(&self, user_id: Uuid, amount: i64, reason: &str) -> Result<i64> {
        self.credits.add(user_id, amount, reason).await
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.maintenance.run_once().await
    }

    pub async fn refill_credits(&self) -> Result<RefillReport> {
        self.credits.refill_all().await
    }
}
