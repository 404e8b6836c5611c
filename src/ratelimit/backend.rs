//! Shared store abstraction used by distributed mode.
//!
//! The sync agent only needs a key/value store with leased mutual-exclusion
//! locks. [`MemoryStore`] provides one inside a single process; networked
//! stores implement [`SharedStore`] the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::SyncSettings;

/// Errors returned by a shared store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The lock could not be obtained within the retry budget
    #[error("lock {0:?} not obtained")]
    LockNotObtained(String),
    /// A release was attempted with a lease that no longer owns the lock
    #[error("lock {0:?} is not held by this lease")]
    LockNotHeld(String),
    /// The store could not be reached or rejected the request
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    /// The stored value could not be decoded or encoded
    #[error("corrupt shared value: {0}")]
    Serialization(String),
}

/// How many times to try for a lock, and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// A single attempt with no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self::new(settings.lock_retry_attempts, settings.lock_retry_backoff())
    }
}

/// Proof of holding a named lock until `lease` elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub token: Uuid,
    pub lease: Duration,
}

/// A key/value store with leased locks, shared by every instance of a group.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Acquire the lock `name`, retrying per `retry`.
    ///
    /// The lock expires on its own after `lease` if never released.
    async fn acquire_lock(
        &self,
        name: &str,
        lease: Duration,
        retry: RetryPolicy,
    ) -> Result<LockLease, StoreError>;

    /// Release a lock obtained from [`SharedStore::acquire_lock`].
    async fn release(&self, lease: &LockLease) -> Result<(), StoreError>;

    /// Read a value; `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value, replacing whatever was there.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    token: Uuid,
    expires_at: Instant,
}

/// In-process [`SharedStore`].
///
/// Limiters in one process that share a `MemoryStore` behave like instances
/// sharing a remote store.
#[derive(Debug)]
pub struct MemoryStore {
    values: DashMap<String, Vec<u8>>,
    locks: DashMap<String, HeldLock>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            locks: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every request fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether `name` is currently locked by an unexpired lease.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|held| held.expires_at > Instant::now())
            .unwrap_or(false)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }

    fn try_obtain(&self, name: &str, lease: Duration) -> Option<LockLease> {
        let now = Instant::now();
        let held = HeldLock {
            token: Uuid::new_v4(),
            expires_at: now + lease,
        };

        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return None;
                }
                debug!(lock = %name, "Taking over expired lock");
                entry.insert(held);
            }
            Entry::Vacant(entry) => {
                entry.insert(held);
            }
        }

        Some(LockLease {
            name: name.to_string(),
            token: held.token,
            lease,
        })
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn acquire_lock(
        &self,
        name: &str,
        lease: Duration,
        retry: RetryPolicy,
    ) -> Result<LockLease, StoreError> {
        let attempts = retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            self.check_available()?;
            if let Some(obtained) = self.try_obtain(name, lease) {
                trace!(lock = %name, attempt, "Lock obtained");
                return Ok(obtained);
            }
            if attempt < attempts {
                tokio::time::sleep(retry.interval).await;
            }
        }

        Err(StoreError::LockNotObtained(name.to_string()))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), StoreError> {
        self.check_available()?;
        let now = Instant::now();
        self.locks
            .remove_if(&lease.name, |_, held| {
                held.token == lease.token && held.expires_at > now
            })
            .map(|_| ())
            .ok_or_else(|| StoreError::LockNotHeld(lease.name.clone()))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check_available()?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}
