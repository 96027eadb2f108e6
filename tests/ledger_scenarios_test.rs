use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, TimeZone, Utc};
use credit_ledger::db::MemoryLedgerStore;
use credit_ledger::domain::{CreditTier, PaymentMethod, RiskTier, TransactionStatus, TransactionType};
use credit_ledger::ports::UserStore;
use credit_ledger::services::{IdGenerator, RequestMetadata};
use credit_ledger::{Ledger, LedgerError, ManualClock};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// Monday, midday UTC: no temporal risk
fn monday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn usd(amount: &str) -> BigDecimal {
    BigDecimal::from_str(amount).unwrap()
}

fn browser() -> RequestMetadata {
    RequestMetadata::new("203.0.113.7", "Mozilla/5.0")
}

struct Harness {
    store: Arc<MemoryLedgerStore>,
    clock: Arc<ManualClock>,
    ledger: Ledger,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(monday_noon()));
        let ledger = Ledger::builder().clock(clock.clone()).build(store.clone());
        Self { store, clock, ledger }
    }

    async fn open_user(&self) -> Uuid {
        let user = Uuid::new_v4();
        self.store.register_user(user, CreditTier::Basic);
        self.ledger.create_account(user, "Main", "usd").await.unwrap();
        user
    }

    async fn deposit(&self, user: Uuid, amount: &str) -> credit_ledger::Result<credit_ledger::domain::Transaction> {
        self.ledger
            .deposit(user, usd(amount), "USD", PaymentMethod::CreditCard, None, browser())
            .await
    }
}

#[tokio::test]
async fn test_deposit_then_purchase_basic_package() {
    let h = Harness::new();
    let user = h.open_user().await;

    let deposit = h.deposit(user, "100.00").await.unwrap();
    assert_eq!(deposit.status, TransactionStatus::Completed);
    assert_eq!(deposit.balance_after, usd("100.00"));
    assert_eq!(deposit.risk_tier, Some(RiskTier::Low));
    assert!(deposit.id.starts_with("TXN"));

    let purchase = h
        .ledger
        .purchase_credits(user, "basic", "USD", browser())
        .await
        .unwrap();
    assert_eq!(purchase.status, TransactionStatus::Completed);
    assert_eq!(purchase.transaction_type, TransactionType::CreditPurchase);
    assert_eq!(purchase.payment_method, PaymentMethod::AccountBalance);
    assert_eq!(purchase.balance_before, usd("100.00"));
    assert_eq!(purchase.balance_after, usd("95.01"));
    assert_eq!(purchase.risk_tier, Some(RiskTier::Low));
    assert_eq!(purchase.fraud_check_passed, Some(true));

    // 20 registration credits plus 50 purchased, clamped to the BASIC ceiling
    let credits = purchase.credits.clone().unwrap();
    assert_eq!(credits.package_id, "basic");
    assert_eq!(credits.credits_purchased, 50);
    assert_eq!(credits.credit_balance_before, 20);
    assert_eq!(credits.credit_balance_after, 50);
    assert_eq!(h.ledger.get_credit_balance(user).await.unwrap(), 50);

    let account = h.ledger.get_account(user).await.unwrap();
    assert_eq!(account.balance, usd("95.01"));
    assert_eq!(account.total_deposits, usd("100.00"));
    assert_eq!(account.total_withdrawals, usd("4.99"));
    assert_eq!(account.successful_transaction_count, 2);

    let stored = h.ledger.get_transaction(user, &purchase.id).await.unwrap();
    assert_eq!(stored, purchase);
    assert_eq!(h.ledger.get_transaction_history(user).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_fourth_identical_deposit_is_blocked() {
    let h = Harness::new();
    let user = h.open_user().await;

    for _ in 0..3 {
        h.deposit(user, "250.00").await.unwrap();
    }

    let err = h.deposit(user, "250.00").await.unwrap_err();
    let blocked_id = match err {
        LedgerError::FraudBlocked {
            transaction_id,
            risk_score,
            risk_tier,
            ..
        } => {
            // velocity 30 + pattern 45 + new account 10 + basic tier 5
            assert_eq!(risk_score, 90);
            assert_eq!(risk_tier, RiskTier::Critical);
            transaction_id
        }
        other => panic!("expected a fraud block, got {:?}", other),
    };

    let blocked = h.ledger.get_transaction(user, &blocked_id).await.unwrap();
    assert_eq!(blocked.status, TransactionStatus::Failed);
    assert_eq!(blocked.fraud_check_passed, Some(false));
    assert_eq!(blocked.risk_score, Some(90));

    let account = h.ledger.get_account(user).await.unwrap();
    assert_eq!(account.balance, usd("750.00"));
    assert_eq!(account.failed_transaction_count, 1);
    assert_eq!(account.transaction_count, 4);
    assert!(!account.frozen);

    // fraud blocks are never offered for retry
    assert!(h.ledger.retry_eligible_transactions(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_frozen_account_rejects_deposits_until_freeze_lapses() {
    let h = Harness::new();
    let user = h.open_user().await;

    h.ledger
        .freeze_account(user, "manual review", Some(Duration::hours(1)))
        .await
        .unwrap();

    match h.deposit(user, "10.00").await.unwrap_err() {
        LedgerError::AccountFrozen { reason, until } => {
            assert_eq!(reason.as_deref(), Some("manual review"));
            assert_eq!(until, Some(monday_noon() + Duration::hours(1)));
        }
        other => panic!("expected AccountFrozen, got {:?}", other),
    }

    h.clock.advance(Duration::hours(2));
    let tx = h.deposit(user, "10.00").await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert!(!h.ledger.get_account(user).await.unwrap().frozen);
}

#[tokio::test]
async fn test_indefinite_freeze_needs_explicit_unfreeze() {
    let h = Harness::new();
    let user = h.open_user().await;

    h.ledger.freeze_account(user, "chargeback", None).await.unwrap();
    h.clock.advance(Duration::days(30));
    assert!(matches!(h.deposit(user, "10.00").await, Err(LedgerError::AccountFrozen { .. })));

    h.ledger.unfreeze_account(user).await.unwrap();
    assert!(h.deposit(user, "10.00").await.is_ok());
}

#[tokio::test]
async fn test_tier_limits_are_enforced() {
    let h = Harness::new();
    let user = h.open_user().await;

    // BASIC single-transaction cap is 500
    assert!(matches!(h.deposit(user, "500.01").await, Err(LedgerError::Validation(_))));

    h.deposit(user, "500.00").await.unwrap();
    h.deposit(user, "500.00").await.unwrap();

    match h.deposit(user, "0.01").await.unwrap_err() {
        LedgerError::LimitExceeded {
            remaining, requested, ..
        } => {
            assert_eq!(remaining, usd("0"));
            assert_eq!(requested, usd("0.01"));
        }
        other => panic!("expected LimitExceeded, got {:?}", other),
    }

    // the daily window rolls over at midnight UTC
    h.clock.advance(Duration::days(1));
    assert!(h.deposit(user, "100.00").await.is_ok());
}

#[tokio::test]
async fn test_input_validation() {
    let h = Harness::new();
    let user = h.open_user().await;

    assert!(matches!(h.deposit(user, "0").await, Err(LedgerError::Validation(_))));
    assert!(matches!(h.deposit(user, "-5.00").await, Err(LedgerError::Validation(_))));
    assert!(matches!(h.deposit(user, "10.001").await, Err(LedgerError::Validation(_))));

    let wrong_currency = h
        .ledger
        .deposit(user, usd("10.00"), "EUR", PaymentMethod::CreditCard, None, browser())
        .await;
    assert!(matches!(wrong_currency, Err(LedgerError::Validation(_))));

    let from_balance = h
        .ledger
        .deposit(user, usd("10.00"), "USD", PaymentMethod::AccountBalance, None, browser())
        .await;
    assert!(matches!(from_balance, Err(LedgerError::Validation(_))));

    let unknown = h.ledger.purchase_credits(user, "platinum", "USD", browser()).await;
    assert!(matches!(unknown, Err(LedgerError::UnknownPackage(_))));

    // nothing above reached the store
    assert!(h.ledger.get_transaction_history(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_purchase_without_funds() {
    let h = Harness::new();
    let user = h.open_user().await;
    h.deposit(user, "3.00").await.unwrap();

    match h.ledger.purchase_credits(user, "basic", "USD", browser()).await.unwrap_err() {
        LedgerError::InsufficientBalance { required, available } => {
            assert_eq!(required, usd("4.99"));
            assert_eq!(available, usd("3.00"));
        }
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }
    assert_eq!(h.ledger.get_credit_balance(user).await.unwrap(), 20);
}

#[tokio::test]
async fn test_concurrent_purchases_only_one_affordable() {
    let h = Harness::new();
    let user = h.open_user().await;
    h.deposit(user, "5.00").await.unwrap();

    let (first, second) = tokio::join!(
        h.ledger.purchase_credits(user, "basic", "USD", browser()),
        h.ledger.purchase_credits(user, "basic", "USD", browser()),
    );

    let results = [first, second];
    let committed = results.iter().filter(|r| r.is_ok()).count();
    let short = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientBalance { .. })))
        .count();
    assert_eq!((committed, short), (1, 1));

    let account = h.ledger.get_account(user).await.unwrap();
    assert_eq!(account.balance, usd("0.01"));
}

#[tokio::test]
async fn test_purchase_credits_clamped_near_ceiling() {
    let h = Harness::new();
    let user = h.open_user().await;
    h.store.set_user_credits(user, 20, 45).await.unwrap();
    h.deposit(user, "20.00").await.unwrap();

    let purchase = h
        .ledger
        .purchase_credits(user, "basic", "USD", browser())
        .await
        .unwrap();
    let credits = purchase.credits.unwrap();
    assert_eq!(credits.credits_purchased, 50);
    assert_eq!(credits.credit_balance_before, 45);
    assert_eq!(credits.credit_balance_after, 50);
    // still charged in full
    assert_eq!(purchase.balance_after, usd("15.01"));
}

#[tokio::test]
async fn test_chat_credits() {
    let h = Harness::new();
    let user = h.open_user().await;

    assert!(h.ledger.has_credits_for_chat(user).await.unwrap());
    assert_eq!(h.ledger.deduct_chat_credits(user).await.unwrap(), 19);

    h.store.set_user_credits(user, 19, 0).await.unwrap();
    assert!(!h.ledger.has_credits_for_chat(user).await.unwrap());
    assert!(matches!(
        h.ledger.deduct_chat_credits(user).await,
        Err(LedgerError::InsufficientCredits { shortfall: 1, .. })
    ));

    let report = h.ledger.refill_credits().await.unwrap();
    assert_eq!(report.refilled, 1);
    assert_eq!(h.ledger.get_credit_balance(user).await.unwrap(), 1);
}

#[tokio::test]
async fn test_account_lifecycle_rules() {
    let h = Harness::new();
    let user = h.open_user().await;

    let duplicate = h.ledger.create_account(user, "Second", "USD").await;
    assert!(matches!(duplicate, Err(LedgerError::DuplicateAccount { .. })));

    let banned = Uuid::new_v4();
    h.store.register_user(banned, CreditTier::Basic);
    h.store.set_banned(banned, true);
    assert!(matches!(
        h.ledger.create_account(banned, "Main", "USD").await,
        Err(LedgerError::PolicyViolation(_))
    ));

    h.deposit(user, "10.00").await.unwrap();
    assert!(matches!(h.ledger.close_account(user).await, Err(LedgerError::PolicyViolation(_))));

    let stats = h.ledger.get_account_statistics(user).await.unwrap();
    assert_eq!(stats.balance, usd("10.00"));
    assert_eq!(stats.transaction_count, 1);
    assert_eq!(stats.daily_remaining, usd("990.00"));
}

#[tokio::test]
async fn test_transactions_are_private_to_their_owner() {
    let h = Harness::new();
    let alice = h.open_user().await;
    let bob = h.open_user().await;

    let tx = h.deposit(alice, "10.00").await.unwrap();
    assert!(matches!(
        h.ledger.get_transaction(bob, &tx.id).await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_catalog_and_tiers() {
    let h = Harness::new();
    let ids: Vec<&str> = h.ledger.list_credit_packages().iter().map(|p| p.id).collect();
    assert_eq!(ids, ["basic", "standard", "premium", "enterprise"]);

    let tiers = h.ledger.verification_tiers();
    assert_eq!(tiers.len(), 4);
    assert_eq!(tiers[0].1.daily, usd("1000"));
}

/// Hands out the first id of each kind twice before moving on.
#[derive(Default)]
struct CollidingIds {
    accounts: AtomicUsize,
    transactions: AtomicUsize,
}

fn repeat_first(counter: &AtomicUsize) -> usize {
    match counter.fetch_add(1, Ordering::SeqCst) {
        0 | 1 => 1,
        n => n,
    }
}

impl IdGenerator for CollidingIds {
    fn account_number(&self) -> String {
        format!("ACC{:010}", repeat_first(&self.accounts))
    }

    fn transaction_id(&self) -> String {
        format!("TXN{:020X}", repeat_first(&self.transactions))
    }
}

#[tokio::test]
async fn test_generated_ids_never_reuse_stored_ones() {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = Ledger::builder()
        .clock(Arc::new(ManualClock::new(monday_noon())))
        .ids(Arc::new(CollidingIds::default()))
        .build(store);

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let first = ledger.create_account(alice, "One", "USD").await.unwrap();
    let second = ledger.create_account(bob, "Two", "USD").await.unwrap();
    assert_eq!(first.account_number, "ACC0000000001");
    assert_eq!(second.account_number, "ACC0000000002");

    let metadata = RequestMetadata::new("203.0.113.7", "Mozilla/5.0");
    let a = ledger
        .deposit(alice, usd("10.00"), "USD", PaymentMethod::CreditCard, None, metadata.clone())
        .await
        .unwrap();
    let b = ledger
        .deposit(bob, usd("10.00"), "USD", PaymentMethod::CreditCard, None, metadata)
        .await
        .unwrap();
    assert_eq!(a.id, "TXN00000000000000000001");
    assert_eq!(b.id, "TXN00000000000000000002");
}
