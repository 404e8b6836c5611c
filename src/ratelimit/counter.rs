//! Sliding-window zone counters.
//!
//! Every zone keeps a small timeline of per-second event counts. The window sum
//! for a zone is the total of the seconds in `[now - window + 1, now]`; older
//! seconds are left in place until the sweeper evicts them.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

/// Events recorded per unix second for one zone.
pub type ZoneTimeline = HashMap<i64, u64>;

/// Per-zone timelines; the full counting state of one limiter and the sync wire shape.
pub type ZoneTable = HashMap<String, ZoneTimeline>;

/// Zone key used when a selector resolves to an empty string.
pub const FALLBACK_ZONE: &str = "misc";

/// Replace an empty resolved key with [`FALLBACK_ZONE`].
pub fn normalize_zone(key: &str) -> &str {
    if key.is_empty() {
        FALLBACK_ZONE
    } else {
        key
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    /// Events counted for this second, local and merged
    count: u64,
    /// Highest shared count already reflected in `count`
    merged: u64,
}

/// Oldest timestamp that is no longer inside the window ending at `now`.
fn window_floor(now: i64, window: u64) -> i64 {
    now.saturating_sub(i64::try_from(window).unwrap_or(i64::MAX))
}

/// Thread-safe table of zone timelines behind a single lock.
#[derive(Debug, Default)]
pub struct ZoneStore {
    zones: Mutex<HashMap<String, HashMap<i64, Slot>>>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of events for `zone` in the window ending at `now`.
    pub fn window_sum(&self, zone: &str, now: i64, window: u64) -> u64 {
        let zones = self.zones.lock();
        Self::sum_locked(&zones, zone, now, window)
    }

    fn sum_locked(
        zones: &HashMap<String, HashMap<i64, Slot>>,
        zone: &str,
        now: i64,
        window: u64,
    ) -> u64 {
        let floor = window_floor(now, window);
        zones
            .get(zone)
            .map(|timeline| {
                timeline
                    .iter()
                    .filter(|(ts, _)| **ts > floor && **ts <= now)
                    .map(|(_, slot)| slot.count)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Record one event for `zone` at `now`.
    pub fn increment(&self, zone: &str, now: i64) {
        let mut zones = self.zones.lock();
        Self::increment_locked(&mut zones, zone, now);
    }

    fn increment_locked(zones: &mut HashMap<String, HashMap<i64, Slot>>, zone: &str, now: i64) {
        zones
            .entry(zone.to_string())
            .or_default()
            .entry(now)
            .or_default()
            .count += 1;
    }

    /// Record one event for `zone` if its window sum is below `max_events`.
    ///
    /// The check and the increment happen under one lock acquisition.
    /// Returns whether the event was recorded.
    pub fn try_admit(&self, zone: &str, now: i64, window: u64, max_events: u64) -> bool {
        let mut zones = self.zones.lock();
        let current = Self::sum_locked(&zones, zone, now, window);

        trace!(zone = %zone, current, max_events, "Checking zone budget");

        if current < max_events {
            Self::increment_locked(&mut zones, zone, now);
            true
        } else {
            false
        }
    }

    /// Fold a remote table into the local one.
    ///
    /// Only seconds newer than both `last_sync` and the window floor are taken.
    /// For each second, the part of the remote count not already merged is added,
    /// so merging the same table twice changes nothing and counts never go down.
    pub fn merge_remote(&self, remote: &ZoneTable, last_sync: i64, now: i64, window: u64) {
        let floor = window_floor(now, window);
        let mut zones = self.zones.lock();

        for (zone, timeline) in remote {
            for (&ts, &count) in timeline {
                if ts <= last_sync || ts <= floor {
                    continue;
                }

                let slot = zones
                    .entry(zone.clone())
                    .or_default()
                    .entry(ts)
                    .or_default();
                if count > slot.merged {
                    slot.count += count - slot.merged;
                    slot.merged = count;
                }
            }
        }
    }

    /// Copy of the current counts.
    pub fn snapshot(&self) -> ZoneTable {
        let zones = self.zones.lock();
        zones
            .iter()
            .map(|(zone, timeline)| {
                let counts = timeline
                    .iter()
                    .map(|(ts, slot)| (*ts, slot.count))
                    .collect();
                (zone.clone(), counts)
            })
            .collect()
    }

    /// Drop every second at or before `now - window`, then every empty zone.
    ///
    /// Returns the number of zones removed.
    pub fn sweep(&self, now: i64, window: u64) -> usize {
        let floor = window_floor(now, window);
        let mut zones = self.zones.lock();

        for timeline in zones.values_mut() {
            timeline.retain(|ts, _| *ts > floor);
        }

        let before = zones.len();
        zones.retain(|_, timeline| !timeline.is_empty());
        before - zones.len()
    }

    /// Number of zones currently tracked.
    pub fn zone_count(&self) -> usize {
        self.zones.lock().len()
    }

    /// Record that `published` was written to the shared store.
    ///
    /// The shared value now carries these counts, so a later merge must only add
    /// what other instances contributed on top of them.
    pub fn mark_published(&self, published: &ZoneTable) {
        let mut zones = self.zones.lock();

        for (zone, timeline) in published {
            let Some(slots) = zones.get_mut(zone) else {
                continue;
            };
            for (ts, &count) in timeline {
                if let Some(slot) = slots.get_mut(ts) {
                    slot.merged = slot.merged.max(count);
                }
            }
        }
    }
}
