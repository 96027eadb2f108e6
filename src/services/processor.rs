//! Transaction Processor.
//!
//! Runs deposits and credit purchases end to end under a per-account lock:
//! resolve the account, validate, open a PENDING record, score it, then either
//! record the block or commit account, credits and transaction as one unit.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LedgerPolicy;
use crate::domain::{
    find_package, Account, AccountStatus, CreditMovement, CreditPackage, NewTransaction, PaymentMethod, Transaction,
    TransactionCategory, TransactionType,
};
use crate::error::{LedgerError, LimitWindow, Result};
use crate::ports::{CreditUpdate, LedgerStore};
use crate::services::accounts::AccountService;
use crate::services::credits::CreditBalanceService;
use crate::services::fraud::FraudRiskEngine;
use crate::services::ids::{unique_transaction_id, IdGenerator};
use crate::services::lock_manager::AccountLocker;

const COMMIT_ATTEMPTS: usize = 3;
const AUTO_FREEZE_REASON: &str = "repeated failed transactions";

/// Caller context forwarded to fraud scoring and the audit columns.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMetadata {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepositRequest {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub description: Option<String>,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub user_id: Uuid,
    pub package_id: String,
    pub currency: String,
    pub metadata: RequestMetadata,
}

/// What a request wants to do, once the inputs are resolved.
enum Operation {
    Deposit {
        payment_method: PaymentMethod,
        description: Option<String>,
    },
    Purchase(&'static CreditPackage),
}

impl Operation {
    fn transaction_type(&self) -> TransactionType {
        match self {
            Operation::Deposit { .. } => TransactionType::Deposit,
            Operation::Purchase(_) => TransactionType::CreditPurchase,
        }
    }
}

pub struct TransactionProcessor {
    store: Arc<dyn LedgerStore>,
    accounts: Arc<AccountService>,
    credits: Arc<CreditBalanceService>,
    fraud: Arc<FraudRiskEngine>,
    locks: Arc<dyn AccountLocker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: LedgerPolicy,
}

impl TransactionProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        accounts: Arc<AccountService>,
        credits: Arc<CreditBalanceService>,
        fraud: Arc<FraudRiskEngine>,
        locks: Arc<dyn AccountLocker>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            store,
            accounts,
            credits,
            fraud,
            locks,
            clock,
            ids,
            policy,
        }
    }

    pub async fn deposit(&self, request: DepositRequest) -> Result<Transaction> {
        if request.payment_method == PaymentMethod::AccountBalance {
            return Err(LedgerError::Validation(
                "deposits must come from an external payment method".to_string(),
            ));
        }
        let operation = Operation::Deposit {
            payment_method: request.payment_method,
            description: request.description,
        };
        self.execute(request.user_id, request.amount, &request.currency, operation, &request.metadata)
            .await
    }

    pub async fn purchase_credits(&self, request: PurchaseRequest) -> Result<Transaction> {
        let package =
            find_package(&request.package_id).ok_or_else(|| LedgerError::UnknownPackage(request.package_id.clone()))?;
        self.execute(
            request.user_id,
            package.price(),
            &request.currency,
            Operation::Purchase(package),
            &request.metadata,
        )
        .await
    }

    async fn execute(
        &self,
        user_id: Uuid,
        amount: BigDecimal,
        currency: &str,
        operation: Operation,
        metadata: &RequestMetadata,
    ) -> Result<Transaction> {
        let account_id = self.accounts.get_active_for_user(user_id).await?.id;
        let _guard = self.locks.lock(account_id).await?;

        // re-read under the lock so validation sees the latest committed state
        let account = self.accounts.get_active_for_user(user_id).await?;
        ensure_usable(&account)?;
        self.validate_amount(&account, &amount, currency)?;

        if matches!(operation, Operation::Purchase(_)) && account.balance < amount {
            return Err(LedgerError::InsufficientBalance {
                required: amount,
                available: account.balance.clone(),
            });
        }

        let mut tx = self.open_pending(&account, amount, &operation, metadata).await?;

        let assessment = self
            .fraud
            .assess(
                &tx,
                &account,
                metadata.ip_address.as_deref(),
                metadata.user_agent.as_deref(),
            )
            .await;
        tx.attach_assessment(&assessment, self.clock.now());

        if !assessment.passed {
            let reason = assessment
                .reason
                .clone()
                .unwrap_or_else(|| "blocked by fraud screening".to_string());
            self.record_block(account, &mut tx, &reason).await;
            return Err(LedgerError::FraudBlocked {
                transaction_id: tx.id,
                risk_score: assessment.risk_score,
                risk_tier: assessment.risk_tier,
                reason,
            });
        }

        match self.commit(account, &tx, &operation, metadata).await {
            Ok(completed) => Ok(completed),
            Err(e) => {
                error!("Transaction {} failed after passing screening: {}", tx.id, e);
                let message = e.to_string();
                if let Err(persist) = tx
                    .mark_failed(message.clone(), self.clock.now())
                    .map_err(LedgerError::processing)
                {
                    error!("{}", persist);
                } else if let Err(persist) = self.store.update_transaction(&tx).await {
                    error!("Could not record failure of transaction {}: {}", tx.id, persist);
                }
                match e {
                    // still retryable by the caller; the next attempt opens a new transaction
                    LedgerError::Conflict(_) => Err(e),
                    _ => Err(LedgerError::Processing {
                        transaction_id: Some(tx.id),
                        message,
                    }),
                }
            }
        }
    }

    fn validate_amount(&self, account: &Account, amount: &BigDecimal, currency: &str) -> Result<()> {
        if *amount <= BigDecimal::zero() {
            return Err(LedgerError::Validation("amount must be greater than zero".to_string()));
        }
        if amount.with_scale(2) != *amount {
            return Err(LedgerError::Validation(
                "amount must have at most 2 decimal places".to_string(),
            ));
        }
        if !currency.trim().eq_ignore_ascii_case(&account.currency) {
            return Err(LedgerError::Validation(format!(
                "currency {} does not match account currency {}",
                currency.trim(),
                account.currency
            )));
        }

        let max_single = account.verification_tier.limits().max_single_transaction;
        if *amount > max_single {
            return Err(LedgerError::Validation(format!(
                "amount {} exceeds the {} tier single transaction limit of {}",
                amount, account.verification_tier, max_single
            )));
        }

        let daily_remaining = account.remaining_daily_limit();
        if *amount > daily_remaining {
            return Err(LedgerError::LimitExceeded {
                window: LimitWindow::Daily,
                limit: account.daily_limit.clone(),
                spent: account.daily_spent.clone(),
                requested: amount.clone(),
                remaining: daily_remaining,
            });
        }
        let monthly_remaining = account.remaining_monthly_limit();
        if *amount > monthly_remaining {
            return Err(LedgerError::LimitExceeded {
                window: LimitWindow::Monthly,
                limit: account.monthly_limit.clone(),
                spent: account.monthly_spent.clone(),
                requested: amount.clone(),
                remaining: monthly_remaining,
            });
        }
        Ok(())
    }

    async fn open_pending(
        &self,
        account: &Account,
        amount: BigDecimal,
        operation: &Operation,
        metadata: &RequestMetadata,
    ) -> Result<Transaction> {
        let transaction_type = operation.transaction_type();
        let balance_after = if transaction_type.is_inflow() {
            &account.balance + &amount
        } else {
            &account.balance - &amount
        };

        let (category, payment_method, description, credits) = match operation {
            Operation::Deposit {
                payment_method,
                description,
            } => (TransactionCategory::AccountFunding, *payment_method, description.clone(), None),
            Operation::Purchase(package) => {
                let update = self.credits.prepare_add(account.user_id, package.credits).await?;
                (
                    TransactionCategory::ServicePurchase,
                    PaymentMethod::AccountBalance,
                    Some(package.description.to_string()),
                    Some(credit_movement(package, &update)),
                )
            }
        };

        let id = unique_transaction_id(&*self.store, &*self.ids).await?;
        let tx = Transaction::pending(
            NewTransaction {
                id,
                account_id: account.id,
                user_id: account.user_id,
                transaction_type,
                category,
                payment_method,
                currency: account.currency.clone(),
                amount,
                balance_before: account.balance.clone(),
                balance_after,
                credits,
                description,
                ip_address: metadata.ip_address.clone(),
                user_agent: metadata.user_agent.clone(),
            },
            self.clock.now(),
        );
        self.store.insert_transaction(&tx).await?;
        Ok(tx)
    }

    /// Applies the mutation and commits it. A lost version or credit race
    /// leaves nothing written, so the account is re-read under the held lock,
    /// revalidated, and the commit tried again.
    async fn commit(
        &self,
        account: Account,
        pending: &Transaction,
        operation: &Operation,
        metadata: &RequestMetadata,
    ) -> Result<Transaction> {
        let mut current = account;
        let mut last_error = None;

        for attempt in 0..COMMIT_ATTEMPTS {
            if attempt > 0 {
                current = self.reload(&current, pending).await?;
            }

            let now = self.clock.now();
            let mut next = current.clone();
            let mut tx = pending.clone();
            let ip = metadata.ip_address.as_deref();

            tx.balance_before = current.balance.clone();
            let credit_update = match operation {
                Operation::Deposit { .. } => {
                    next.apply_deposit(&tx.amount, ip, now);
                    None
                }
                Operation::Purchase(package) => {
                    next.apply_debit(&tx.amount, ip, now);
                    let update = self.credits.prepare_add(current.user_id, package.credits).await?;
                    tx.credits = Some(credit_movement(package, &update));
                    Some(update)
                }
            };
            tx.balance_after = next.balance.clone();
            tx.mark_completed(now).map_err(LedgerError::processing)?;

            match self.store.commit(&next, credit_update.as_ref(), &tx).await {
                Ok(stored) => {
                    info!(
                        "Transaction {} completed: {} {} on account {} (balance {} -> {})",
                        tx.id,
                        tx.transaction_type,
                        tx.amount,
                        stored.account_number,
                        tx.balance_before,
                        stored.balance
                    );
                    return Ok(tx);
                }
                Err(LedgerError::Conflict(message)) => {
                    warn!("Commit of transaction {} conflicted: {}", tx.id, message);
                    last_error = Some(LedgerError::Conflict(message));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| LedgerError::Conflict(format!("transaction {} was not committed", pending.id))))
    }

    /// Fresh copy of the account for another commit attempt, checked again
    /// against everything `execute` validated on the first read.
    async fn reload(&self, stale: &Account, pending: &Transaction) -> Result<Account> {
        let account = self.accounts.get_active_for_user(stale.user_id).await?;
        ensure_usable(&account)?;
        self.validate_amount(&account, &pending.amount, &pending.currency)?;
        if !pending.transaction_type.is_inflow() && account.balance < pending.amount {
            return Err(LedgerError::InsufficientBalance {
                required: pending.amount.clone(),
                available: account.balance.clone(),
            });
        }
        Ok(account)
    }

    fn apply_block(&self, account: &mut Account, now: DateTime<Utc>) {
        account.record_failed_attempt(now);
        let threshold = self.policy.auto_freeze_after_failures;
        if threshold > 0 && account.failed_transaction_count >= threshold && !account.frozen {
            account.freeze(AUTO_FREEZE_REASON, Some(now + self.policy.auto_freeze_duration), now);
            warn!(
                "Account {} frozen after {} failed transactions",
                account.account_number, account.failed_transaction_count
            );
        }
    }

    /// Persists a fraud block: the transaction fails and the account's failed
    /// counter grows, freezing the account once it reaches the threshold. A
    /// lost version race re-reads the account and applies the block again.
    async fn record_block(&self, account: Account, tx: &mut Transaction, reason: &str) {
        let now = self.clock.now();
        if let Err(e) = tx.mark_failed(reason, now) {
            error!("{}", e);
            return;
        }

        let mut current = account;
        for attempt in 0..COMMIT_ATTEMPTS {
            if attempt > 0 {
                current = match self.store.find_account_by_user(current.user_id).await {
                    Ok(Some(fresh)) => fresh,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Could not re-read account {} after a block: {}", current.account_number, e);
                        break;
                    }
                };
            }

            let mut next = current.clone();
            self.apply_block(&mut next, now);
            match self.store.record_failure(&next, tx).await {
                Ok(_) => {
                    warn!("Transaction {} blocked: {}", tx.id, reason);
                    return;
                }
                Err(LedgerError::Conflict(message)) => {
                    warn!("Recording block of transaction {} conflicted: {}", tx.id, message);
                }
                Err(e) => {
                    error!("Could not record fraud block of transaction {}: {}", tx.id, e);
                    break;
                }
            }
        }

        // the account counters are lost, but the row must not stay PENDING
        match self.store.update_transaction(tx).await {
            Ok(()) => warn!("Transaction {} blocked without updating account risk counters", tx.id),
            Err(e) => error!("Could not mark blocked transaction {} as failed: {}", tx.id, e),
        }
    }
}

fn ensure_usable(account: &Account) -> Result<()> {
    if account.frozen {
        return Err(LedgerError::AccountFrozen {
            reason: account.freeze_reason.clone(),
            until: account.freeze_expires_at,
        });
    }
    if account.status != AccountStatus::Active {
        return Err(LedgerError::AccountNotActive { status: account.status });
    }
    Ok(())
}

fn credit_movement(package: &CreditPackage, update: &CreditUpdate) -> CreditMovement {
    CreditMovement {
        package_id: package.id.to_string(),
        credits_purchased: package.credits,
        credit_balance_before: update.expected,
        credit_balance_after: update.new,
    }
}
