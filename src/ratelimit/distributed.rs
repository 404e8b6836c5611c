//! Cross-instance synchronization of zone counters.
//!
//! Instances that share a group key periodically reconcile their local
//! [`ZoneStore`] with one value in a [`SharedStore`]. Each cycle runs under a
//! leased lock named after the group key:
//!
//! 1. acquire the lock
//! 2. read the shared table (missing means empty)
//! 3. merge it into the local store
//! 4. write the merged local table back
//! 5. release the lock
//!
//! The result is eventually consistent. Merging only considers seconds newer
//! than the previous successful sync, so instance clocks are assumed to be
//! roughly aligned.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::{RetryPolicy, SharedStore, StoreError};
use super::clock::Clock;
use super::counter::{ZoneStore, ZoneTable};
use crate::config::SyncSettings;

/// Encode a zone table for the shared store.
pub fn encode_table(table: &ZoneTable) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(table).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a zone table read from the shared store.
pub fn decode_table(bytes: &[u8]) -> Result<ZoneTable, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Reconciles one limiter's counters with the rest of its instance group.
pub struct SyncAgent {
    store: Arc<ZoneStore>,
    shared: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    group_key: String,
    window_secs: u64,
    settings: SyncSettings,
    /// Timestamp of the last successful read; 0 before the first sync
    last_sync: AtomicI64,
}

impl SyncAgent {
    pub fn new(
        store: Arc<ZoneStore>,
        shared: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        group_key: impl Into<String>,
        window_secs: u64,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            shared,
            clock,
            group_key: group_key.into(),
            window_secs,
            settings,
            last_sync: AtomicI64::new(0),
        }
    }

    /// Timestamp of the last successful sync cycle.
    pub fn last_sync(&self) -> i64 {
        self.last_sync.load(Ordering::SeqCst)
    }

    /// Run one full sync cycle.
    ///
    /// On failure the local store is either untouched or only merged (never
    /// corrupted), and `last_sync` keeps its previous value.
    pub async fn sync_once(&self) -> Result<(), StoreError> {
        let lock_name = self.settings.lock_name(&self.group_key);
        let lease = self
            .shared
            .acquire_lock(
                &lock_name,
                self.settings.lock_lease(),
                RetryPolicy::from(&self.settings),
            )
            .await?;

        trace!(lock = %lock_name, "Sync lock obtained");

        let exchanged = self.exchange().await;
        let released = self.shared.release(&lease).await;

        let read_at = exchanged?;
        released?;

        self.last_sync.store(read_at, Ordering::SeqCst);
        debug!(
            group = %self.group_key,
            last_sync = read_at,
            zones = self.store.zone_count(),
            "Synced zone counters"
        );
        Ok(())
    }

    /// Read, merge and write back. Must be called with the group lock held.
    /// Returns the timestamp the shared value was read at.
    async fn exchange(&self) -> Result<i64, StoreError> {
        let raw = self.shared.get(&self.group_key).await?;
        let now = self.clock.now();

        let remote = match raw {
            Some(bytes) => decode_table(&bytes)?,
            None => ZoneTable::new(),
        };

        self.store
            .merge_remote(&remote, self.last_sync(), now, self.window_secs);

        let published = self.store.snapshot();
        self.shared
            .set(&self.group_key, encode_table(&published)?)
            .await?;
        // Committed even if the release below fails, so never merge it back in
        self.store.mark_published(&published);

        Ok(now)
    }

    /// Sync immediately, then every `interval`, until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(group = %self.group_key, interval = ?interval, "Sync agent started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(group = %self.group_key, error = %e, "Sync cycle failed");
                    }
                }
            }
        }
        debug!(group = %self.group_key, "Sync agent stopped");
    }
}
