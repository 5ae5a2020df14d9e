use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_scalar, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::LockError;
use crate::utils::to_db_timestamp;

/// Lock key guarding the firings of one job
pub fn job_lock_key(job_name: &str) -> String {
    format!("scheduler:job:{}", job_name)
}

#[derive(Debug)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

/// Lease-based lock shared by every scheduler instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError>;
    async fn release(&self, guard: LockGuard) -> Result<(), LockError>;
    async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<(), LockError>;
    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;
}

struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-local lock, enough for a single instance and for tests
pub struct InMemoryDistributedLock {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryDistributedLock {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDistributedLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if !entry.is_expired() {
                return Err(LockError::AlreadyLocked(key.to_string()));
            }
        }
        let token = Uuid::new_v4().to_string();
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(LockGuard {
            key: key.to_string(),
            token,
        })
    }

    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(&guard.key) {
            Some(entry) if entry.token == guard.token => {
                locks.remove(&guard.key);
                Ok(())
            }
            Some(_) => Err(LockError::TokenMismatch),
            None => Err(LockError::LockNotFound(guard.key)),
        }
    }

    async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(&guard.key) {
            Some(entry) if entry.token == guard.token => {
                entry.expires_at = Instant::now() + ttl;
                Ok(())
            }
            Some(_) => Err(LockError::TokenMismatch),
            None => Err(LockError::LockNotFound(guard.key.clone())),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let locks = self.locks.lock().await;
        Ok(locks.get(key).map_or(false, |e| !e.is_expired()))
    }
}

/// Lock rows in `scheduler_locks`, shared by every instance pointed at the
/// same database. Expiry is wall-clock milliseconds so that instances agree.
#[derive(Clone)]
pub struct SqliteDistributedLock {
    pool: SqlitePool,
    owner: String,
}

impl SqliteDistributedLock {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner: format!("pid-{}", std::process::id()),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    fn expiry_ms(ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(ttl_ms)
    }

    /// Explains why a token-guarded statement touched no row
    async fn miss_reason(&self, key: &str) -> LockError {
        match query_scalar::<_, i64>("SELECT COUNT(*) FROM scheduler_locks WHERE lock_key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
        {
            Ok(0) => LockError::LockNotFound(key.to_string()),
            Ok(_) => LockError::TokenMismatch,
            Err(e) => LockError::from(e),
        }
    }
}

#[async_trait]
impl DistributedLock for SqliteDistributedLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();

        // The upsert only replaces a row whose lease has run out
        let result = query(
            "INSERT INTO scheduler_locks (lock_key, token, locked_by, locked_at, expires_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(lock_key) DO UPDATE SET
                token = excluded.token,
                locked_by = excluded.locked_by,
                locked_at = excluded.locked_at,
                expires_at_ms = excluded.expires_at_ms
             WHERE scheduler_locks.expires_at_ms <= ?"
        )
        .bind(key)
        .bind(&token)
        .bind(&self.owner)
        .bind(to_db_timestamp(&now))
        .bind(Self::expiry_ms(ttl))
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LockError::AlreadyLocked(key.to_string()));
        }

        Ok(LockGuard {
            key: key.to_string(),
            token,
        })
    }

    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let result = query("DELETE FROM scheduler_locks WHERE lock_key = ? AND token = ?")
            .bind(&guard.key)
            .bind(&guard.token)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss_reason(&guard.key).await);
        }
        Ok(())
    }

    async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<(), LockError> {
        let result = query("UPDATE scheduler_locks SET expires_at_ms = ? WHERE lock_key = ? AND token = ?")
            .bind(Self::expiry_ms(ttl))
            .bind(&guard.key)
            .bind(&guard.token)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss_reason(&guard.key).await);
        }
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM scheduler_locks WHERE lock_key = ? AND expires_at_ms > ?"
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

/// Minimum and maximum hold time of a firing's lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub at_least: Duration,
    pub at_most: Duration,
}

impl LeasePolicy {
    pub fn new(at_least: Duration, at_most: Duration) -> Self {
        Self {
            at_least: at_least.min(at_most),
            at_most,
        }
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(120))
    }
}

/// A held lease; hand it back through [`LeasedLock::finish`].
#[derive(Debug)]
pub struct Lease {
    guard: LockGuard,
    acquired_at: Instant,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.guard.key
    }
}

/// Applies a [`LeasePolicy`] on top of a [`DistributedLock`].
///
/// The lease is taken with a TTL of `at_most`, so a crashed holder frees the
/// key on its own. A firing that finishes before `at_least` keeps the key
/// until that mark, which stops a second instance with a slightly skewed
/// clock from firing the same schedule slot again.
#[derive(Clone)]
pub struct LeasedLock {
    lock: Arc<dyn DistributedLock>,
    policy: LeasePolicy,
}

impl LeasedLock {
    pub fn new(lock: Arc<dyn DistributedLock>, policy: LeasePolicy) -> Self {
        Self { lock, policy }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// `Ok(None)` when another holder has the key.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, LockError> {
        match self.lock.acquire(key, self.policy.at_most).await {
            Ok(guard) => Ok(Some(Lease {
                guard,
                acquired_at: Instant::now(),
            })),
            Err(LockError::AlreadyLocked(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Pushes the expiry out to a fresh `at_most` while the firing runs.
    pub async fn renew(&self, lease: &Lease) -> Result<(), LockError> {
        self.lock.extend(&lease.guard, self.policy.at_most).await
    }

    pub fn renew_interval(&self) -> Duration {
        (self.policy.at_most / 2).max(Duration::from_millis(10))
    }

    pub async fn finish(&self, lease: Lease) -> Result<(), LockError> {
        let held = lease.acquired_at.elapsed();
        if held < self.policy.at_least {
            self.lock.extend(&lease.guard, self.policy.at_least - held).await
        } else {
            self.lock.release(lease.guard).await
        }
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        self.lock.is_locked(key).await
    }
}
