//! Background eviction of counters that fell out of the window.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::clock::Clock;
use super::counter::ZoneStore;

/// Periodically sweeps a [`ZoneStore`] until cancelled.
pub struct Sweeper {
    store: Arc<ZoneStore>,
    clock: Arc<dyn Clock>,
    window_secs: u64,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<ZoneStore>,
        clock: Arc<dyn Clock>,
        window_secs: u64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            window_secs,
            interval,
        }
    }

    /// Run one sweep now. Returns the number of zones removed.
    pub fn sweep_once(&self) -> usize {
        let now = self.clock.now();
        let removed = self.store.sweep(now, self.window_secs);
        trace!(now, removed, zones = self.store.zone_count(), "Swept zone counters");
        removed
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; there is nothing to sweep yet.
        ticker.tick().await;

        debug!(interval = ?self.interval, window = self.window_secs, "Sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once();
                }
            }
        }
        debug!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const NOW: i64 = 1_704_067_200;

    #[test]
    fn test_sweep_once_uses_clock() {
        let store = Arc::new(ZoneStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        store.increment("a", NOW);

        let sweeper = Sweeper::new(store.clone(), clock.clone(), 2, Duration::from_secs(5));
        assert_eq!(sweeper.sweep_once(), 0);

        clock.advance(2);
        assert_eq!(sweeper.sweep_once(), 1);
        assert_eq!(store.zone_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_on_interval_and_stops() {
        let store = Arc::new(ZoneStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        store.increment("a", NOW);

        let sweeper = Sweeper::new(store.clone(), clock.clone(), 1, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(cancel.clone()));

        clock.advance(10);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.zone_count(), 1, "no sweep before the first interval");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.zone_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
