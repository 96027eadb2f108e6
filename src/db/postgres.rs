//! Postgres ledger store.
//!
//! Enum columns are stored as TEXT and parsed on the way out. `commit` runs the
//! account, credit and transaction writes inside one database transaction.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::domain::{
    Account, CreditMovement, CreditTier, Transaction, TransactionStatus, UserCredits,
};
use crate::error::{LedgerError, Result};
use crate::ports::{AccountStore, CreditUpdate, LedgerStore, StatusCounts, TransactionStore, UserStore};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    account_number: String,
    user_id: Uuid,
    account_name: String,
    balance: BigDecimal,
    currency: String,
    status: String,
    verification_tier: String,
    daily_limit: BigDecimal,
    monthly_limit: BigDecimal,
    daily_spent: BigDecimal,
    monthly_spent: BigDecimal,
    last_daily_reset: DateTime<Utc>,
    last_monthly_reset: DateTime<Utc>,
    failed_transaction_count: i32,
    frozen: bool,
    freeze_reason: Option<String>,
    freeze_expires_at: Option<DateTime<Utc>>,
    last_transaction_ip: Option<String>,
    last_login_ip: Option<String>,
    total_deposits: BigDecimal,
    total_withdrawals: BigDecimal,
    transaction_count: i64,
    successful_transaction_count: i64,
    last_transaction_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AccountRow> for Account {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: row.id,
            account_number: row.account_number,
            user_id: row.user_id,
            account_name: row.account_name,
            balance: row.balance,
            currency: row.currency,
            status: row.status.parse().map_err(corrupt_row)?,
            verification_tier: row.verification_tier.parse().map_err(corrupt_row)?,
            daily_limit: row.daily_limit,
            monthly_limit: row.monthly_limit,
            daily_spent: row.daily_spent,
            monthly_spent: row.monthly_spent,
            last_daily_reset: row.last_daily_reset,
            last_monthly_reset: row.last_monthly_reset,
            failed_transaction_count: row.failed_transaction_count,
            frozen: row.frozen,
            freeze_reason: row.freeze_reason,
            freeze_expires_at: row.freeze_expires_at,
            last_transaction_ip: row.last_transaction_ip,
            last_login_ip: row.last_login_ip,
            total_deposits: row.total_deposits,
            total_withdrawals: row.total_withdrawals,
            transaction_count: row.transaction_count,
            successful_transaction_count: row.successful_transaction_count,
            last_transaction_at: row.last_transaction_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            closed_at: row.closed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: String,
    account_id: Uuid,
    user_id: Uuid,
    transaction_type: String,
    category: String,
    payment_method: String,
    currency: String,
    amount: BigDecimal,
    balance_before: BigDecimal,
    balance_after: BigDecimal,
    package_id: Option<String>,
    credits_purchased: Option<i64>,
    credit_balance_before: Option<i64>,
    credit_balance_after: Option<i64>,
    status: String,
    description: Option<String>,
    risk_score: Option<i32>,
    risk_tier: Option<String>,
    fraud_check_passed: Option<bool>,
    fraud_reason: Option<String>,
    risk_analysis: Option<serde_json::Value>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    failure_reason: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let credits = match (
            row.package_id,
            row.credits_purchased,
            row.credit_balance_before,
            row.credit_balance_after,
        ) {
            (Some(package_id), Some(purchased), Some(before), Some(after)) => Some(CreditMovement {
                package_id,
                credits_purchased: purchased,
                credit_balance_before: before,
                credit_balance_after: after,
            }),
            _ => None,
        };

        Ok(Transaction {
            id: row.id,
            account_id: row.account_id,
            user_id: row.user_id,
            transaction_type: row.transaction_type.parse().map_err(corrupt_row)?,
            category: row.category.parse().map_err(corrupt_row)?,
            payment_method: row.payment_method.parse().map_err(corrupt_row)?,
            currency: row.currency,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            credits,
            status: row.status.parse().map_err(corrupt_row)?,
            description: row.description,
            risk_score: row.risk_score,
            risk_tier: row.risk_tier.map(|t| t.parse()).transpose().map_err(corrupt_row)?,
            fraud_check_passed: row.fraud_check_passed,
            fraud_reason: row.fraud_reason,
            risk_analysis: row.risk_analysis,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            failure_reason: row.failure_reason,
            retry_count: row.retry_count,
            created_at: row.created_at,
            processed_at: row.processed_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            updated_at: row.updated_at,
        })
    }
}

fn corrupt_row(e: String) -> LedgerError {
    LedgerError::processing(format!("corrupt row: {}", e))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

const UPDATE_ACCOUNT_SQL: &str = r#"
    UPDATE accounts SET
        account_name = $3, balance = $4, currency = $5, status = $6, verification_tier = $7,
        daily_limit = $8, monthly_limit = $9, daily_spent = $10, monthly_spent = $11,
        last_daily_reset = $12, last_monthly_reset = $13, failed_transaction_count = $14,
        frozen = $15, freeze_reason = $16, freeze_expires_at = $17,
        last_transaction_ip = $18, last_login_ip = $19,
        total_deposits = $20, total_withdrawals = $21,
        transaction_count = $22, successful_transaction_count = $23,
        last_transaction_at = $24, updated_at = $25, closed_at = $26,
        version = version + 1
    WHERE id = $1 AND version = $2
    RETURNING *
"#;

const UPDATE_TRANSACTION_SQL: &str = r#"
    UPDATE transactions SET
        status = $2, risk_score = $3, risk_tier = $4, fraud_check_passed = $5,
        fraud_reason = $6, risk_analysis = $7, failure_reason = $8, retry_count = $9,
        processed_at = $10, completed_at = $11, failed_at = $12, updated_at = $13,
        balance_before = $14, balance_after = $15,
        credit_balance_before = $16, credit_balance_after = $17
    WHERE id = $1
"#;

async fn update_account_with(conn: &mut PgConnection, account: &Account) -> Result<Account> {
    let row = sqlx::query_as::<_, AccountRow>(UPDATE_ACCOUNT_SQL)
        .bind(account.id)
        .bind(account.version)
        .bind(&account.account_name)
        .bind(&account.balance)
        .bind(&account.currency)
        .bind(account.status.as_str())
        .bind(account.verification_tier.as_str())
        .bind(&account.daily_limit)
        .bind(&account.monthly_limit)
        .bind(&account.daily_spent)
        .bind(&account.monthly_spent)
        .bind(account.last_daily_reset)
        .bind(account.last_monthly_reset)
        .bind(account.failed_transaction_count)
        .bind(account.frozen)
        .bind(&account.freeze_reason)
        .bind(account.freeze_expires_at)
        .bind(&account.last_transaction_ip)
        .bind(&account.last_login_ip)
        .bind(&account.total_deposits)
        .bind(&account.total_withdrawals)
        .bind(account.transaction_count)
        .bind(account.successful_transaction_count)
        .bind(account.last_transaction_at)
        .bind(account.updated_at)
        .bind(account.closed_at)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => row.try_into(),
        None => Err(LedgerError::Conflict(format!(
            "account {} was modified concurrently (expected version {})",
            account.id, account.version
        ))),
    }
}

async fn update_transaction_with(conn: &mut PgConnection, tx: &Transaction) -> Result<()> {
    let result = sqlx::query(UPDATE_TRANSACTION_SQL)
        .bind(&tx.id)
        .bind(tx.status.as_str())
        .bind(tx.risk_score)
        .bind(tx.risk_tier.map(|t| t.as_str()))
        .bind(tx.fraud_check_passed)
        .bind(&tx.fraud_reason)
        .bind(&tx.risk_analysis)
        .bind(&tx.failure_reason)
        .bind(tx.retry_count)
        .bind(tx.processed_at)
        .bind(tx.completed_at)
        .bind(tx.failed_at)
        .bind(tx.updated_at)
        .bind(&tx.balance_before)
        .bind(&tx.balance_after)
        .bind(tx.credits.as_ref().map(|c| c.credit_balance_before))
        .bind(tx.credits.as_ref().map(|c| c.credit_balance_after))
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::NotFound(format!("transaction {}", tx.id)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Seeds the user projection; a no-op if the user already exists.
    pub async fn register_user(&self, user_id: Uuid, tier: CreditTier) -> Result<UserCredits> {
        let credits = UserCredits::registered(user_id, tier);
        sqlx::query(
            "INSERT INTO users (id, credits, credit_tier) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(user_id)
        .bind(credits.credits)
        .bind(tier.as_str())
        .execute(&self.pool)
        .await?;
        Ok(credits)
    }
}

#[async_trait]
impl AccountStore for PgLedgerStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (
                id, account_number, user_id, account_name, balance, currency, status, verification_tier,
                daily_limit, monthly_limit, daily_spent, monthly_spent, last_daily_reset, last_monthly_reset,
                failed_transaction_count, frozen, freeze_reason, freeze_expires_at,
                last_transaction_ip, last_login_ip, total_deposits, total_withdrawals,
                transaction_count, successful_transaction_count, last_transaction_at,
                version, created_at, updated_at, closed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
            )
            "#,
        )
        .bind(account.id)
        .bind(&account.account_number)
        .bind(account.user_id)
        .bind(&account.account_name)
        .bind(&account.balance)
        .bind(&account.currency)
        .bind(account.status.as_str())
        .bind(account.verification_tier.as_str())
        .bind(&account.daily_limit)
        .bind(&account.monthly_limit)
        .bind(&account.daily_spent)
        .bind(&account.monthly_spent)
        .bind(account.last_daily_reset)
        .bind(account.last_monthly_reset)
        .bind(account.failed_transaction_count)
        .bind(account.frozen)
        .bind(&account.freeze_reason)
        .bind(account.freeze_expires_at)
        .bind(&account.last_transaction_ip)
        .bind(&account.last_login_ip)
        .bind(&account.total_deposits)
        .bind(&account.total_withdrawals)
        .bind(account.transaction_count)
        .bind(account.successful_transaction_count)
        .bind(account.last_transaction_at)
        .bind(account.version)
        .bind(account.created_at)
        .bind(account.updated_at)
        .bind(account.closed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                if self.find_account_by_user(account.user_id).await?.is_some() {
                    Err(LedgerError::DuplicateAccount {
                        user_id: account.user_id,
                    })
                } else {
                    Err(LedgerError::Conflict(format!(
                        "account number {} already taken",
                        account.account_number
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_account_by_user(&self, user_id: Uuid) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Account::try_from)
            .transpose()
    }

    async fn account_number_exists(&self, account_number: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE account_number = $1)")
            .bind(account_number)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn update_account(&self, account: &Account) -> Result<Account> {
        let mut conn = self.pool.acquire().await?;
        update_account_with(&mut conn, account).await
    }

    async fn list_frozen_accounts(&self) -> Result<Vec<Account>> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE frozen ORDER BY freeze_expires_at ASC")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Account::try_from)
            .collect()
    }

    async fn list_accounts_due_for_reset(
        &self,
        day_start: DateTime<Utc>,
        month_start: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE last_daily_reset < $1 OR last_monthly_reset < $2",
        )
        .bind(day_start)
        .bind(month_start)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Account::try_from)
        .collect()
    }
}

#[async_trait]
impl TransactionStore for PgLedgerStore {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        let credits = tx.credits.as_ref();
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, account_id, user_id, transaction_type, category, payment_method, currency,
                amount, balance_before, balance_after, package_id, credits_purchased,
                credit_balance_before, credit_balance_after, status, description,
                risk_score, risk_tier, fraud_check_passed, fraud_reason, risk_analysis,
                ip_address, user_agent, failure_reason, retry_count,
                created_at, processed_at, completed_at, failed_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30
            )
            "#,
        )
        .bind(&tx.id)
        .bind(tx.account_id)
        .bind(tx.user_id)
        .bind(tx.transaction_type.as_str())
        .bind(tx.category.as_str())
        .bind(tx.payment_method.as_str())
        .bind(&tx.currency)
        .bind(&tx.amount)
        .bind(&tx.balance_before)
        .bind(&tx.balance_after)
        .bind(credits.map(|c| c.package_id.clone()))
        .bind(credits.map(|c| c.credits_purchased))
        .bind(credits.map(|c| c.credit_balance_before))
        .bind(credits.map(|c| c.credit_balance_after))
        .bind(tx.status.as_str())
        .bind(&tx.description)
        .bind(tx.risk_score)
        .bind(tx.risk_tier.map(|t| t.as_str()))
        .bind(tx.fraud_check_passed)
        .bind(&tx.fraud_reason)
        .bind(&tx.risk_analysis)
        .bind(&tx.ip_address)
        .bind(&tx.user_agent)
        .bind(&tx.failure_reason)
        .bind(tx.retry_count)
        .bind(tx.created_at)
        .bind(tx.processed_at)
        .bind(tx.completed_at)
        .bind(tx.failed_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::Conflict(format!("transaction id {} already exists", tx.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_transaction_with(&mut conn, tx).await
    }

    async fn transaction_id_exists(&self, id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM transactions WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn list_transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Transaction::try_from)
        .collect()
    }

    async fn list_transactions_since(&self, account_id: Uuid, since: DateTime<Utc>) -> Result<Vec<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE account_id = $1 AND created_at >= $2 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Transaction::try_from)
        .collect()
    }

    async fn expire_failed_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET status = $3, updated_at = $2
            WHERE status = $4 AND COALESCE(failed_at, updated_at) < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(TransactionStatus::Expired.as_str())
        .bind(TransactionStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_pending_before(&self, cutoff: DateTime<Utc>, reason: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET status = $4, failure_reason = $2, failed_at = $3, updated_at = $3
            WHERE status = $5 AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(reason)
        .bind(now)
        .bind(TransactionStatus::Failed.as_str())
        .bind(TransactionStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM transactions WHERE created_at >= $1 GROUP BY status",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.parse::<TransactionStatus>().map_err(corrupt_row)? {
                TransactionStatus::Pending => counts.pending = count,
                TransactionStatus::Completed => counts.completed = count,
                TransactionStatus::Failed => counts.failed = count,
                TransactionStatus::Expired => counts.expired = count,
            }
        }
        Ok(counts)
    }

    async fn count_pending_before(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE status = $1 AND created_at < $2")
            .bind(TransactionStatus::Pending.as_str())
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_frozen_accounts(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts WHERE frozen")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl UserStore for PgLedgerStore {
    async fn is_user_banned(&self, user_id: Uuid) -> Result<bool> {
        let banned: Option<bool> = sqlx::query_scalar("SELECT banned FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(banned.unwrap_or(false))
    }

    async fn get_user_credits(&self, user_id: Uuid) -> Result<Option<UserCredits>> {
        let row: Option<(Uuid, i64, String)> =
            sqlx::query_as("SELECT id, credits, credit_tier FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(user_id, credits, tier)| {
            Ok(UserCredits {
                user_id,
                credits,
                tier: tier.parse().map_err(corrupt_row)?,
            })
        })
        .transpose()
    }

    async fn set_user_credits(&self, user_id: Uuid, expected: i64, new: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET credits = $3, updated_at = NOW() WHERE id = $1 AND credits = $2")
            .bind(user_id)
            .bind(expected)
            .bind(new)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_user_credits(&self) -> Result<Vec<UserCredits>> {
        let rows: Vec<(Uuid, i64, String)> = sqlx::query_as("SELECT id, credits, credit_tier FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(user_id, credits, tier)| {
                Ok(UserCredits {
                    user_id,
                    credits,
                    tier: tier.parse().map_err(corrupt_row)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn commit(&self, account: &Account, credits: Option<&CreditUpdate>, tx: &Transaction) -> Result<Account> {
        let mut db_tx = self.pool.begin().await?;

        let stored = update_account_with(&mut *db_tx, account).await?;

        if let Some(update) = credits {
            let result = sqlx::query("UPDATE users SET credits = $3, updated_at = NOW() WHERE id = $1 AND credits = $2")
                .bind(update.user_id)
                .bind(update.expected)
                .bind(update.new)
                .execute(&mut *db_tx)
                .await?;
            if result.rows_affected() != 1 {
                // dropping db_tx rolls back the account write
                return Err(LedgerError::Conflict(format!(
                    "credit balance for user {} changed concurrently",
                    update.user_id
                )));
            }
        }

        update_transaction_with(&mut *db_tx, tx).await?;
        db_tx.commit().await?;

        Ok(stored)
    }

    async fn record_failure(&self, account: &Account, tx: &Transaction) -> Result<Account> {
        let mut db_tx = self.pool.begin().await?;
        let stored = update_account_with(&mut *db_tx, account).await?;
        update_transaction_with(&mut *db_tx, tx).await?;
        db_tx.commit().await?;
        Ok(stored)
    }
}
