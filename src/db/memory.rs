//! In-memory ledger store.
//!
//! Everything sits behind one mutex, which makes `commit` trivially atomic.
//! Used for embedding the ledger without Postgres and throughout the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{Account, CreditTier, Transaction, TransactionStatus, UserCredits};
use crate::error::{LedgerError, Result};
use crate::ports::{AccountStore, CreditUpdate, LedgerStore, StatusCounts, TransactionStore, UserStore};

#[derive(Debug, Clone)]
struct UserRecord {
    credits: UserCredits,
    banned: bool,
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    account_by_user: HashMap<Uuid, Uuid>,
    transactions: Vec<Transaction>,
    transaction_index: HashMap<String, usize>,
    users: HashMap<Uuid, UserRecord>,
}

impl State {
    fn check_account_version(&self, account: &Account) -> Result<()> {
        let stored = self
            .accounts
            .get(&account.id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", account.id)))?;
        if stored.version != account.version {
            return Err(LedgerError::Conflict(format!(
                "account {} was modified concurrently (expected version {}, found {})",
                account.id, account.version, stored.version
            )));
        }
        Ok(())
    }

    fn put_account(&mut self, account: &Account) -> Account {
        let mut stored = account.clone();
        stored.version += 1;
        self.accounts.insert(stored.id, stored.clone());
        stored
    }

    fn transaction_slot(&self, id: &str) -> Result<usize> {
        self.transaction_index
            .get(id)
            .copied()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stands in for the external user registration flow.
    pub fn register_user(&self, user_id: Uuid, tier: CreditTier) -> UserCredits {
        let credits = UserCredits::registered(user_id, tier);
        self.state().users.insert(
            user_id,
            UserRecord {
                credits: credits.clone(),
                banned: false,
            },
        );
        credits
    }

    pub fn set_banned(&self, user_id: Uuid, banned: bool) {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.banned = banned;
        }
    }

    /// Overwrites the stored account, bypassing the version check.
    pub fn force_account(&self, account: Account) {
        let mut state = self.state();
        state.account_by_user.insert(account.user_id, account.id);
        state.accounts.insert(account.id, account);
    }

    /// Overwrites a stored transaction, bypassing the state machine.
    pub fn force_transaction(&self, tx: Transaction) {
        let mut state = self.state();
        match state.transaction_index.get(&tx.id).copied() {
            Some(slot) => state.transactions[slot] = tx,
            None => {
                let slot = state.transactions.len();
                state.transaction_index.insert(tx.id.clone(), slot);
                state.transactions.push(tx);
            }
        }
    }
}

#[async_trait]
impl AccountStore for MemoryLedgerStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut state = self.state();
        if state.account_by_user.contains_key(&account.user_id) {
            return Err(LedgerError::DuplicateAccount {
                user_id: account.user_id,
            });
        }
        if state.accounts.values().any(|a| a.account_number == account.account_number) {
            return Err(LedgerError::Conflict(format!(
                "account number {} already taken",
                account.account_number
            )));
        }
        state.account_by_user.insert(account.user_id, account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn find_account_by_user(&self, user_id: Uuid) -> Result<Option<Account>> {
        let state = self.state();
        Ok(state
            .account_by_user
            .get(&user_id)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn account_number_exists(&self, account_number: &str) -> Result<bool> {
        Ok(self
            .state()
            .accounts
            .values()
            .any(|a| a.account_number == account_number))
    }

    async fn update_account(&self, account: &Account) -> Result<Account> {
        let mut state = self.state();
        state.check_account_version(account)?;
        Ok(state.put_account(account))
    }

    async fn list_frozen_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state().accounts.values().filter(|a| a.frozen).cloned().collect())
    }

    async fn list_accounts_due_for_reset(
        &self,
        day_start: DateTime<Utc>,
        month_start: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        Ok(self
            .state()
            .accounts
            .values()
            .filter(|a| a.last_daily_reset < day_start || a.last_monthly_reset < month_start)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransactionStore for MemoryLedgerStore {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state();
        if state.transaction_index.contains_key(&tx.id) {
            return Err(LedgerError::Conflict(format!("transaction id {} already exists", tx.id)));
        }
        let slot = state.transactions.len();
        state.transaction_index.insert(tx.id.clone(), slot);
        state.transactions.push(tx.clone());
        Ok(())
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state();
        let slot = state.transaction_slot(&tx.id)?;
        state.transactions[slot] = tx.clone();
        Ok(())
    }

    async fn transaction_id_exists(&self, id: &str) -> Result<bool> {
        Ok(self.state().transaction_index.contains_key(id))
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        let state = self.state();
        Ok(state
            .transaction_index
            .get(id)
            .map(|slot| state.transactions[*slot].clone()))
    }

    async fn list_transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>> {
        Ok(self
            .state()
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn list_transactions_since(&self, account_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Transaction>> {
        Ok(self
            .state()
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id && t.created_at >= since)
            .cloned()
            .collect())
    }

    async fn expire_failed_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let mut expired = 0;
        for tx in state.transactions.iter_mut() {
            let failed_at = tx.failed_at.unwrap_or(tx.updated_at);
            if tx.status == TransactionStatus::Failed && failed_at < cutoff && tx.mark_expired(now).is_ok() {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn fail_pending_before(&self, cutoff: DateTime<Utc>, reason: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let mut failed = 0;
        for tx in state.transactions.iter_mut() {
            if tx.status == TransactionStatus::Pending && tx.created_at < cutoff && tx.mark_failed(reason, now).is_ok() {
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<StatusCounts> {
        let state = self.state();
        let mut counts = StatusCounts::default();
        for tx in state.transactions.iter().filter(|t| t.created_at >= since) {
            match tx.status {
                TransactionStatus::Pending => counts.pending += 1,
                TransactionStatus::Completed => counts.completed += 1,
                TransactionStatus::Failed => counts.failed += 1,
                TransactionStatus::Expired => counts.expired += 1,
            }
        }
        Ok(counts)
    }

    async fn count_pending_before(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .state()
            .transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Pending && t.created_at < cutoff)
            .count() as i64)
    }

    async fn count_frozen_accounts(&self) -> Result<i64> {
        Ok(self.state().accounts.values().filter(|a| a.frozen).count() as i64)
    }
}

#[async_trait]
impl UserStore for MemoryLedgerStore {
    async fn is_user_banned(&self, user_id: Uuid) -> Result<bool> {
        Ok(self.state().users.get(&user_id).map_or(false, |u| u.banned))
    }

    async fn get_user_credits(&self, user_id: Uuid) -> Result<Option<UserCredits>> {
        Ok(self.state().users.get(&user_id).map(|u| u.credits.clone()))
    }

    async fn set_user_credits(&self, user_id: Uuid, expected: i64, new: i64) -> Result<bool> {
        let mut state = self.state();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))?;
        if user.credits.credits != expected {
            return Ok(false);
        }
        user.credits.credits = new;
        Ok(true)
    }

    async fn list_user_credits(&self) -> Result<Vec<UserCredits>> {
        Ok(self.state().users.values().map(|u| u.credits.clone()).collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn commit(&self, account: &Account, credits: Option<&CreditUpdate>, tx: &Transaction) -> Result<Account> {
        let mut state = self.state();

        // validate everything before touching anything
        state.check_account_version(account)?;
        let slot = state.transaction_slot(&tx.id)?;
        if let Some(update) = credits {
            let user = state
                .users
                .get(&update.user_id)
                .ok_or_else(|| LedgerError::NotFound(format!("user {}", update.user_id)))?;
            if user.credits.credits != update.expected {
                return Err(LedgerError::Conflict(format!(
                    "credit balance for user {} changed concurrently",
                    update.user_id
                )));
            }
        }

        if let Some(update) = credits {
            if let Some(user) = state.users.get_mut(&update.user_id) {
                user.credits.credits = update.new;
            }
        }
        state.transactions[slot] = tx.clone();
        Ok(state.put_account(account))
    }

    async fn record_failure(&self, account: &Account, tx: &Transaction) -> Result<Account> {
        let mut state = self.state();
        state.check_account_version(account)?;
        let slot = state.transaction_slot(&tx.id)?;
        state.transactions[slot] = tx.clone();
        Ok(state.put_account(account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VerificationTier;

    fn account(user_id: Uuid, number: &str) -> Account {
        Account::open(
            user_id,
            number.to_string(),
            "Main".to_string(),
            "USD".to_string(),
            VerificationTier::Basic,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_one_account_per_user() {
        let store = MemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.insert_account(&account(user, "ACC0000000001")).await.unwrap();
        let err = store.insert_account(&account(user, "ACC0000000002")).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateAccount { .. }));
        assert!(store.account_number_exists("ACC0000000001").await.unwrap());
        assert!(!store.account_number_exists("ACC0000000002").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let store = MemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.insert_account(&account(user, "ACC0000000001")).await.unwrap();

        let first = store.find_account_by_user(user).await.unwrap().unwrap();
        let stale = first.clone();

        let updated = store.update_account(&first).await.unwrap();
        assert_eq!(updated.version, first.version + 1);

        let err = store.update_account(&stale).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_credit_compare_and_set() {
        let store = MemoryLedgerStore::new();
        let user = Uuid::new_v4();
        store.register_user(user, CreditTier::Basic);

        assert!(store.set_user_credits(user, 20, 25).await.unwrap());
        assert!(!store.set_user_credits(user, 20, 30).await.unwrap());
        assert_eq!(store.get_user_credits(user).await.unwrap().unwrap().credits, 25);
    }
}
