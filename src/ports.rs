//! Persistence ports.
//! The ledger only talks to storage through these traits; `db` provides the
//! Postgres and in-memory adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Account, Transaction, UserCredits};
use crate::error::Result;

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `DuplicateAccount` if the user already owns an account.
    async fn insert_account(&self, account: &Account) -> Result<()>;

    async fn find_account_by_user(&self, user_id: Uuid) -> Result<Option<Account>>;

    async fn account_number_exists(&self, account_number: &str) -> Result<bool>;

    /// Writes `account` only if the stored version still equals
    /// `account.version`, otherwise fails with `Conflict`. Returns the stored
    /// copy carrying the bumped version.
    async fn update_account(&self, account: &Account) -> Result<Account>;

    async fn list_frozen_accounts(&self) -> Result<Vec<Account>>;

    /// Accounts whose daily reset predates `day_start` or whose monthly reset
    /// predates `month_start`.
    async fn list_accounts_due_for_reset(
        &self,
        day_start: DateTime<Utc>,
        month_start: DateTime<Utc>,
    ) -> Result<Vec<Account>>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<()>;

    async fn update_transaction(&self, tx: &Transaction) -> Result<()>;

    async fn transaction_id_exists(&self, id: &str) -> Result<bool>;

    async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>>;

    /// Newest first.
    async fn list_transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>>;

    /// Transactions created at or after `since`, newest first.
    async fn list_transactions_since(&self, account_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Transaction>>;

    /// FAILED rows that failed before `cutoff` become EXPIRED. Returns the count.
    async fn expire_failed_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// PENDING rows created before `cutoff` become FAILED with `reason`.
    async fn fail_pending_before(&self, cutoff: DateTime<Utc>, reason: &str, now: DateTime<Utc>) -> Result<u64>;

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<StatusCounts>;

    async fn count_pending_before(&self, cutoff: DateTime<Utc>) -> Result<i64>;

    async fn count_frozen_accounts(&self) -> Result<i64>;
}

/// The slice of the (external) user record the ledger reads and writes.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn is_user_banned(&self, user_id: Uuid) -> Result<bool>;

    async fn get_user_credits(&self, user_id: Uuid) -> Result<Option<UserCredits>>;

    /// Compare-and-set on the credit counter. `Ok(false)` means the stored
    /// value was no longer `expected`.
    async fn set_user_credits(&self, user_id: Uuid, expected: i64, new: i64) -> Result<bool>;

    async fn list_user_credits(&self) -> Result<Vec<UserCredits>>;
}

/// Credit counter change applied inside a [`LedgerStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditUpdate {
    pub user_id: Uuid,
    pub expected: i64,
    pub new: i64,
}

#[async_trait]
pub trait LedgerStore: AccountStore + TransactionStore + UserStore {
    /// Applies the version-checked account write, the optional credit
    /// compare-and-set and the transaction update as one unit: either all
    /// land or none do.
    async fn commit(&self, account: &Account, credits: Option<&CreditUpdate>, tx: &Transaction) -> Result<Account>;

    /// Persists a failed attempt: the account's risk counters and the FAILED
    /// transaction land together.
    async fn record_failure(&self, account: &Account, tx: &Transaction) -> Result<Account>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    pub expired: i64,
}

impl StatusCounts {
    /// Completed over finalized (completed + failed + expired); `None` with no
    /// finalized rows.
    pub fn success_rate(&self) -> Option<f64> {
        let finalized = self.completed + self.failed + self.expired;
        if finalized == 0 {
            None
        } else {
            Some(self.completed as f64 / finalized as f64)
        }
    }
}
