//! Credit Balance Service.
//!
//! Credits live on the user record and are only ever changed with a
//! compare-and-set on the previous value. Additions are clamped to the tier
//! ceiling.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::UserCredits;
use crate::error::{LedgerError, Result};
use crate::ports::{CreditUpdate, LedgerStore};

const MAX_CAS_ATTEMPTS: usize = 5;
const REFILL_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefillReport {
    pub refilled: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct CreditBalanceService {
    store: Arc<dyn LedgerStore>,
}

impl CreditBalanceService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn load(&self, user_id: Uuid) -> Result<UserCredits> {
        self.store
            .get_user_credits(user_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))
    }

    pub async fn get_balance(&self, user_id: Uuid) -> Result<i64> {
        Ok(self.load(user_id).await?.credits)
    }

    pub async fn has_enough_for(&self, user_id: Uuid, cost: i64) -> Result<bool> {
        Ok(self.get_balance(user_id).await? >= cost)
    }

    /// Returns the balance after the deduction.
    pub async fn deduct(&self, user_id: Uuid, cost: i64) -> Result<i64> {
        if cost <= 0 {
            return Err(LedgerError::Validation("credit cost must be positive".to_string()));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load(user_id).await?.credits;
            if current < cost {
                return Err(LedgerError::InsufficientCredits {
                    required: cost,
                    available: current,
                    shortfall: cost - current,
                });
            }
            let new = current - cost;
            if self.store.set_user_credits(user_id, current, new).await? {
                debug!("Deducted {} credits from user {} ({} -> {})", cost, user_id, current, new);
                return Ok(new);
            }
        }
        Err(self.lost_race(user_id))
    }

    /// Adds up to `amount`, never past the tier ceiling. At the ceiling this is
    /// a no-op that returns the unchanged balance.
    pub async fn add(&self, user_id: Uuid, amount: i64, reason: &str) -> Result<i64> {
        self.apply_add(user_id, amount, reason).await.map(|update| update.new)
    }

    async fn apply_add(&self, user_id: Uuid, amount: i64, reason: &str) -> Result<CreditUpdate> {
        if amount <= 0 {
            return Err(LedgerError::Validation("credit amount must be positive".to_string()));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let update = self.prepare_add(user_id, amount).await?;
            if update.new == update.expected {
                debug!("User {} already at credit ceiling, nothing added ({})", user_id, reason);
                return Ok(update);
            }
            if self.store.set_user_credits(user_id, update.expected, update.new).await? {
                info!(
                    "Added {} credits to user {} for {} ({} -> {})",
                    update.new - update.expected,
                    user_id,
                    reason,
                    update.expected,
                    update.new
                );
                return Ok(update);
            }
        }
        Err(self.lost_race(user_id))
    }

    /// One auto-refill credit. `false` when the user had reached the ceiling
    /// by the time the grant was applied.
    async fn refill_user(&self, user_id: Uuid) -> Result<bool> {
        let update = self.apply_add(user_id, 1, "auto-refill").await?;
        Ok(update.new > update.expected)
    }

    /// Computes the clamped addition against the current balance without
    /// writing it, for callers that apply it inside a larger commit.
    pub async fn prepare_add(&self, user_id: Uuid, amount: i64) -> Result<CreditUpdate> {
        let credits = self.load(user_id).await?;
        let applied = amount.min(credits.headroom()).max(0);
        if applied < amount {
            warn!(
                "Credit addition for user {} clamped from {} to {} by the {} ceiling",
                user_id,
                amount,
                applied,
                credits.ceiling()
            );
        }
        Ok(CreditUpdate {
            user_id,
            expected: credits.credits,
            new: credits.credits + applied,
        })
    }

    /// Grants one credit to every user below their ceiling. Failures are
    /// counted and logged per user; the run always completes.
    pub async fn refill_all(&self) -> Result<RefillReport> {
        let users = self.store.list_user_credits().await?;
        let due: Vec<Uuid> = users.iter().filter(|u| !u.is_at_ceiling()).map(|u| u.user_id).collect();
        let mut report = RefillReport {
            skipped: (users.len() - due.len()) as u64,
            ..RefillReport::default()
        };

        let results: Vec<(Uuid, Result<bool>)> = stream::iter(due)
            .map(|user_id| async move { (user_id, self.refill_user(user_id).await) })
            .buffer_unordered(REFILL_CONCURRENCY)
            .collect()
            .await;

        for (user_id, result) in results {
            match result {
                Ok(true) => report.refilled += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!("Credit refill failed for user {}: {}", user_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Credit refill complete: {} refilled, {} skipped, {} failed",
            report.refilled, report.skipped, report.failed
        );
        Ok(report)
    }

    fn lost_race(&self, user_id: Uuid) -> LedgerError {
        warn!("Gave up updating credits for user {} after repeated conflicts", user_id);
        LedgerError::Conflict(format!("credit balance for user {} is changing too fast", user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryLedgerStore;
    use crate::domain::CreditTier;
    use crate::ports::UserStore;

    fn service() -> (Arc<MemoryLedgerStore>, CreditBalanceService) {
        let store = Arc::new(MemoryLedgerStore::new());
        (store.clone(), CreditBalanceService::new(store))
    }

    #[tokio::test]
    async fn test_add_is_clamped_to_ceiling() {
        let (store, credits) = service();
        let user = Uuid::new_v4();
        store.register_user(user, CreditTier::Basic);
        store.set_user_credits(user, 20, 45).await.unwrap();

        assert_eq!(credits.add(user, 100, "purchase").await.unwrap(), 50);
        // at the ceiling: no-op
        assert_eq!(credits.add(user, 10, "purchase").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_deduct_reports_shortfall() {
        let (store, credits) = service();
        let user = Uuid::new_v4();
        store.register_user(user, CreditTier::Basic);
        store.set_user_credits(user, 20, 2).await.unwrap();

        match credits.deduct(user, 5).await.unwrap_err() {
            LedgerError::InsufficientCredits {
                required,
                available,
                shortfall,
            } => {
                assert_eq!((required, available, shortfall), (5, 2, 3));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(credits.get_balance(user).await.unwrap(), 2);
        assert_eq!(credits.deduct(user, 2).await.unwrap(), 0);
        assert!(!credits.has_enough_for(user, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (_, credits) = service();
        let err = credits.get_balance(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_refill_skips_users_at_ceiling() {
        let (store, credits) = service();
        let below = Uuid::new_v4();
        let full = Uuid::new_v4();
        store.register_user(below, CreditTier::Basic);
        store.register_user(full, CreditTier::Basic);
        store.set_user_credits(full, 20, 50).await.unwrap();

        let report = credits.refill_all().await.unwrap();
        assert_eq!(report, RefillReport { refilled: 1, skipped: 1, failed: 0 });
        assert_eq!(credits.get_balance(below).await.unwrap(), 21);
        assert_eq!(credits.get_balance(full).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_refill_grant_at_ceiling_is_not_counted() {
        let (store, credits) = service();
        let user = Uuid::new_v4();
        store.register_user(user, CreditTier::Basic);
        store.set_user_credits(user, 20, 49).await.unwrap();

        assert!(credits.refill_user(user).await.unwrap());
        // reached the ceiling after the due list was built
        assert!(!credits.refill_user(user).await.unwrap());
        assert_eq!(credits.get_balance(user).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_concurrent_deductions_never_go_negative() {
        let (store, credits) = service();
        let credits = Arc::new(credits);
        let user = Uuid::new_v4();
        store.register_user(user, CreditTier::Basic);

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let credits = credits.clone();
                tokio::spawn(async move { credits.deduct(user, 1).await })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        let left = credits.get_balance(user).await.unwrap();
        assert!(left >= 0);
        assert_eq!(20 - ok, left);
    }
}
