//! Per-account mutual exclusion.
//!
//! The processor holds one of these guards for the whole validate, score,
//! mutate and persist sequence. `LocalAccountLocks` serializes within one
//! process; `LockManager` uses Redis so several workers can share a database.

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

#[async_trait]
pub trait AccountLocker: Send + Sync {
    /// Waits for exclusive access to `account_id`. Gives up with `Conflict`
    /// once the configured wait has elapsed.
    async fn lock(&self, account_id: Uuid) -> Result<AccountGuard>;
}

/// Held for the duration of one committed mutation; dropping it releases.
#[allow(dead_code)] // variants are held only for their Drop
pub enum AccountGuard {
    Local(OwnedMutexGuard<()>),
    Distributed(Lock),
}

fn lock_timeout(account_id: Uuid, waited: Duration) -> LedgerError {
    LedgerError::Conflict(format!(
        "account {} is busy; lock not acquired within {}ms",
        account_id,
        waited.as_millis()
    ))
}

/// In-process keyed mutexes, one per account id.
pub struct LocalAccountLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    wait: Duration,
}

impl LocalAccountLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait,
        }
    }

    fn slot(&self, account_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() > 1024 {
            // nobody else references these, so nobody is waiting on them
            locks.retain(|_, m| Arc::strong_count(m) > 1);
        }
        locks.entry(account_id).or_default().clone()
    }
}

#[async_trait]
impl AccountLocker for LocalAccountLocks {
    async fn lock(&self, account_id: Uuid) -> Result<AccountGuard> {
        let slot = self.slot(account_id);
        match tokio::time::timeout(self.wait, slot.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired local lock for account {}", account_id);
                Ok(AccountGuard::Local(guard))
            }
            Err(_) => {
                warn!("Timed out waiting for local lock on account {}", account_id);
                Err(lock_timeout(account_id, self.wait))
            }
        }
    }
}

/// Redis-backed account locks shared by every worker pointed at the same
/// Redis. Taken with `SET NX EX`; released with a token-checked delete so an
/// expired holder can never release someone else's lock.
pub struct LockManager {
    client: Client,
    ttl: Duration,
    wait: Duration,
}

/// A held Redis lock. Dropping it without [`Lock::release`] releases it in
/// the background; if that fails too the TTL reclaims the key.
pub struct Lock {
    key: String,
    token: String,
    client: Client,
    released: bool,
}

impl LockManager {
    pub fn new(redis_url: &str, ttl_secs: u64) -> std::result::Result<Self, redis::RedisError> {
        Ok(Self {
            client: Client::open(redis_url)?,
            ttl: Duration::from_secs(ttl_secs),
            wait: Duration::from_secs(5),
        })
    }

    pub fn with_acquire_timeout(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn key_for(account_id: Uuid) -> String {
        format!("credit-ledger:account-lock:{}", account_id)
    }

    /// Polls until the key is free or `wait` runs out. `None` means timed out.
    pub async fn acquire(
        &self,
        account_id: Uuid,
        wait: Duration,
    ) -> std::result::Result<Option<Lock>, redis::RedisError> {
        let key = Self::key_for(account_id);
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let taken: Option<String> = conn
                .set_options(
                    &key,
                    &token,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::EX(self.ttl.as_secs() as usize)),
                )
                .await?;

            if taken.is_some() {
                debug!("Took Redis lock {}", key);
                return Ok(Some(Lock {
                    key,
                    token,
                    client: self.client.clone(),
                    released: false,
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
impl AccountLocker for LockManager {
    async fn lock(&self, account_id: Uuid) -> Result<AccountGuard> {
        match self.acquire(account_id, self.wait).await {
            Ok(Some(lock)) => Ok(AccountGuard::Distributed(lock)),
            Ok(None) => {
                warn!("Timed out waiting for Redis lock on account {}", account_id);
                Err(lock_timeout(account_id, self.wait))
            }
            Err(e) => Err(LedgerError::processing(format!("lock backend unavailable: {}", e))),
        }
    }
}

async fn delete_if_owned(client: &Client, key: &str, token: &str) -> std::result::Result<bool, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let deleted: i32 = Script::new(RELEASE_SCRIPT)
        .key(key)
        .arg(token)
        .invoke_async(&mut conn)
        .await?;
    Ok(deleted == 1)
}

impl Lock {
    /// Returns `false` if the key had already expired or changed hands.
    pub async fn release(mut self) -> std::result::Result<bool, redis::RedisError> {
        self.released = true;
        let owned = delete_if_owned(&self.client, &self.key, &self.token).await?;
        if !owned {
            warn!("Redis lock {} expired before it was released", self.key);
        }
        Ok(owned)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let client = self.client.clone();
        runtime.spawn(async move {
            if let Err(e) = delete_if_owned(&client, &key, &token).await {
                warn!("Background release of {} failed: {}", key, e);
            }
        });
    }
}
