use bigdecimal::{BigDecimal, Zero};
use chrono::{Duration, TimeZone, Utc};
use credit_ledger::db::MemoryLedgerStore;
use credit_ledger::domain::{credit_packages, CreditTier, PaymentMethod, TransactionStatus, TransactionType};
use credit_ledger::services::RequestMetadata;
use credit_ledger::{Ledger, ManualClock};
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Op {
    Deposit(i64),
    Purchase(usize),
    Chat,
    Wait(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1i64..=60_000).prop_map(Op::Deposit),
        3 => (0usize..4).prop_map(Op::Purchase),
        2 => Just(Op::Chat),
        1 => (1i64..=48).prop_map(Op::Wait),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever mix of requests succeeds or fails, the balance is exactly the
    /// completed inflows minus completed outflows, and credits stay in range.
    #[test]
    fn prop_balance_reconciles_with_history(ops in prop::collection::vec(op(), 1..25)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async move {
            let store = Arc::new(MemoryLedgerStore::new());
            let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()));
            let ledger = Ledger::builder().clock(clock.clone()).build(store.clone());

            let user = Uuid::new_v4();
            store.register_user(user, CreditTier::Basic);
            ledger.create_account(user, "Main", "USD").await.unwrap();
            let metadata = RequestMetadata::new("192.0.2.10", "proptest");

            for op in ops {
                match op {
                    Op::Deposit(cents) => {
                        let _ = ledger
                            .deposit(user, BigDecimal::new(cents.into(), 2), "USD", PaymentMethod::DebitCard, None, metadata.clone())
                            .await;
                    }
                    Op::Purchase(i) => {
                        let _ = ledger.purchase_credits(user, credit_packages()[i].id, "USD", metadata.clone()).await;
                    }
                    Op::Chat => {
                        let _ = ledger.deduct_chat_credits(user).await;
                    }
                    Op::Wait(hours) => clock.advance(Duration::hours(hours)),
                }
            }

            let history = ledger.get_transaction_history(user).await.unwrap();
            let mut expected = BigDecimal::zero();
            for tx in history.iter().filter(|t| t.status == TransactionStatus::Completed) {
                match tx.transaction_type {
                    TransactionType::Deposit => {
                        prop_assert_eq!(&tx.balance_after, &(&tx.balance_before + &tx.amount));
                        expected = &expected + &tx.amount;
                    }
                    TransactionType::CreditPurchase => {
                        prop_assert_eq!(&tx.balance_after, &(&tx.balance_before - &tx.amount));
                        prop_assert!(tx.credits.is_some());
                        expected = &expected - &tx.amount;
                    }
                    _ => {}
                }
            }
            for tx in history.iter().filter(|t| t.status != TransactionStatus::Completed) {
                prop_assert!(tx.completed_at.is_none());
            }

            let account = ledger.get_account(user).await.unwrap();
            prop_assert_eq!(&account.balance, &expected);
            prop_assert_eq!(&(&account.total_deposits - &account.total_withdrawals), &account.balance);
            prop_assert!(account.balance >= BigDecimal::zero());
            prop_assert!(account.daily_spent <= account.daily_limit);
            prop_assert!(account.monthly_spent <= account.monthly_limit);

            let credits = ledger.get_credit_balance(user).await.unwrap();
            prop_assert!((0..=CreditTier::Basic.ceiling()).contains(&credits));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
