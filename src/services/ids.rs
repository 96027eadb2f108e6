//! Account numbers and transaction ids.
//!
//! Generation is random; uniqueness is enforced by checking the store and
//! drawing again on a hit.

use tracing::warn;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ports::{AccountStore, TransactionStore};

const MAX_ATTEMPTS: usize = 10;

pub trait IdGenerator: Send + Sync {
    /// `ACC` followed by 10 digits.
    fn account_number(&self) -> String;

    /// `TXN` followed by 20 upper-case hex characters.
    fn transaction_id(&self) -> String;
}

/// Draws from v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn account_number(&self) -> String {
        format!("ACC{:010}", Uuid::new_v4().as_u128() % 10_000_000_000)
    }

    fn transaction_id(&self) -> String {
        let hex = Uuid::new_v4().simple().to_string().to_uppercase();
        format!("TXN{}", &hex[..20])
    }
}

pub async fn unique_account_number<S>(store: &S, ids: &dyn IdGenerator) -> Result<String>
where
    S: AccountStore + ?Sized,
{
    for _ in 0..MAX_ATTEMPTS {
        let candidate = ids.account_number();
        if !store.account_number_exists(&candidate).await? {
            return Ok(candidate);
        }
        warn!("Account number collision on {}, drawing again", candidate);
    }
    Err(LedgerError::processing("could not allocate a unique account number"))
}

pub async fn unique_transaction_id<S>(store: &S, ids: &dyn IdGenerator) -> Result<String>
where
    S: TransactionStore + ?Sized,
{
    for _ in 0..MAX_ATTEMPTS {
        let candidate = ids.transaction_id();
        if !store.transaction_id_exists(&candidate).await? {
            return Ok(candidate);
        }
        warn!("Transaction id collision on {}, drawing again", candidate);
    }
    Err(LedgerError::processing("could not allocate a unique transaction id"))
}
