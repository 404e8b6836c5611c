//! Zone limiter: the admission decision plus the background tasks around it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use super::backend::SharedStore;
use super::clock::{Clock, SystemClock};
use super::counter::{normalize_zone, ZoneStore};
use super::directive::{Action, GroupKeySource, LimiterConfig};
use super::distributed::SyncAgent;
use super::host::{Interruption, Transaction};
use super::sweeper::Sweeper;
use crate::config::SyncSettings;
use crate::error::{Result, ZonelimitError};

/// Outcome of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the event may proceed
    pub allowed: bool,
    /// What the host should do on denial
    pub action: Action,
    /// Status to report on denial
    pub status: u16,
}

impl Verdict {
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }
}

/// Collaborators a limiter is built with.
#[derive(Clone)]
pub struct LimiterDeps {
    pub clock: Arc<dyn Clock>,
    /// Required when the directive enables distributed mode
    pub shared_store: Option<Arc<dyn SharedStore>>,
    pub sync: SyncSettings,
    /// Cancelling this token stops the limiter's background tasks
    pub cancel: CancellationToken,
}

impl Default for LimiterDeps {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            shared_store: None,
            sync: SyncSettings::default(),
            cancel: CancellationToken::new(),
        }
    }
}

impl LimiterDeps {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    pub fn with_sync_settings(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A rate limiter for one rule.
///
/// Owns the zone counters, a sweeper task, and in distributed mode a sync task.
/// Must be started inside a tokio runtime.
pub struct ZoneLimiter {
    config: Arc<LimiterConfig>,
    store: Arc<ZoneStore>,
    clock: Arc<dyn Clock>,
    sync_agent: Option<Arc<SyncAgent>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for ZoneLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneLimiter")
            .field("config", &self.config)
            .field("zones", &self.store.zone_count())
            .finish()
    }
}

impl ZoneLimiter {
    /// Parse `directive` and start a limiter for it.
    pub fn from_directive<G: GroupKeySource + ?Sized>(
        directive: &str,
        group_key: &G,
        deps: LimiterDeps,
    ) -> Result<Self> {
        let config = LimiterConfig::parse(directive, group_key)?;
        Self::start(config, deps)
    }

    /// Start a limiter and its background tasks.
    pub fn start(config: LimiterConfig, deps: LimiterDeps) -> Result<Self> {
        let config = Arc::new(config);
        // Fires on our own shutdown or when the host cancels its token
        let cancel = deps.cancel.child_token();
        let store = Arc::new(ZoneStore::new());
        let tasks = TaskTracker::new();

        let sweeper = Sweeper::new(
            store.clone(),
            deps.clock.clone(),
            config.window_secs(),
            config.sweep_interval(),
        );

        let sync_agent = match config.distributed() {
            Some(distributed) => {
                let shared = deps.shared_store.clone().ok_or_else(|| {
                    ZonelimitError::Config("distributed mode requires a shared store".into())
                })?;
                let agent = Arc::new(SyncAgent::new(
                    store.clone(),
                    shared,
                    deps.clock.clone(),
                    distributed.group_key(),
                    config.window_secs(),
                    deps.sync.clone(),
                ));
                tasks.spawn(
                    agent
                        .clone()
                        .run(distributed.sync_interval(), cancel.clone()),
                );
                Some(agent)
            }
            None => None,
        };

        tasks.spawn(sweeper.run(cancel.clone()));
        tasks.close();

        info!(
            zones = config.selectors().len(),
            max_events = config.max_events(),
            window = config.window_secs(),
            distributed = config.is_distributed(),
            "Zone limiter started"
        );

        Ok(Self {
            config,
            store,
            clock: deps.clock,
            sync_agent,
            cancel,
            tasks,
        })
    }

    /// Decide on one event given the zone key resolved for each selector, in order.
    ///
    /// Every selector whose zone still has budget is charged one event; the event
    /// is allowed if at least one selector passed. Each zone's check-and-charge is
    /// atomic, but the loop over selectors is not, so concurrent events can
    /// overshoot a zone's budget slightly.
    pub fn decide<K: AsRef<str>>(&self, keys: &[K], now: i64) -> Verdict {
        let mut passing = 0;

        for index in 0..self.config.selectors().len() {
            let zone = normalize_zone(keys.get(index).map(|k| k.as_ref()).unwrap_or(""));
            let admitted = self.store.try_admit(
                zone,
                now,
                self.config.window_secs(),
                self.config.max_events(),
            );

            trace!(zone = %zone, admitted, "Selector evaluated");
            if admitted {
                passing += 1;
            }
        }

        let allowed = passing > 0;
        if !allowed {
            debug!(
                selectors = self.config.selectors().len(),
                max_events = self.config.max_events(),
                "Rate limit exceeded"
            );
        }

        Verdict {
            allowed,
            action: self.config.action(),
            status: self.config.status(),
        }
    }

    /// Evaluate a host transaction, interrupting it on denial.
    pub fn evaluate<T: Transaction + ?Sized>(&self, rule_id: u64, tx: &mut T) -> Verdict {
        let keys: Vec<String> = self
            .config
            .selectors()
            .iter()
            .map(|selector| tx.resolve_zone_key(selector))
            .collect();

        let verdict = self.decide(keys.as_slice(), self.clock.now());
        if verdict.is_denied() {
            debug!(
                rule_id,
                keys = ?keys,
                action = %verdict.action,
                status = verdict.status,
                "Interrupting transaction"
            );
            tx.interrupt(Interruption {
                rule_id,
                action: verdict.action,
                status: verdict.status,
            });
        }
        verdict
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The limiter's zone counters.
    pub fn store(&self) -> &Arc<ZoneStore> {
        &self.store
    }

    /// The sync agent, present in distributed mode.
    pub fn sync_agent(&self) -> Option<&Arc<SyncAgent>> {
        self.sync_agent.as_ref()
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.wait().await;
        info!("Zone limiter stopped");
    }
}

impl Drop for ZoneLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::MemoryStore;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::directive::{NoGroupKey, StaticGroupKey, DEFAULT_SWEEP_INTERVAL_SECS};
    use crate::ratelimit::host::AttributeMap;
    use std::time::Duration;

    const NOW: i64 = 1_704_067_200;

    fn limiter(directive: &str, clock: Arc<ManualClock>) -> ZoneLimiter {
        let deps = LimiterDeps::default().with_clock(clock);
        ZoneLimiter::from_directive(directive, &NoGroupKey, deps).unwrap()
    }

    #[tokio::test]
    async fn test_single_zone_budget_and_recovery() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter("zone[]=h&events=5&window=3", clock);

        for i in 0..5 {
            assert!(limiter.decide(&["h"], NOW).allowed, "event {} should pass", i);
        }
        assert!(limiter.decide(&["h"], NOW).is_denied());

        // Still inside the window
        assert!(limiter.decide(&["h"], NOW + 2).is_denied());
        // A full window later the budget is back
        assert!(limiter.decide(&["h"], NOW + 3).allowed);

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_deny_scenario_reports_action_and_status() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter(
            "zone[]=%{REQUEST_HEADERS.host}&events=200&window=1&interval=2&action=deny&status=403",
            clock,
        );

        for _ in 0..200 {
            let mut tx = AttributeMap::new().with("REQUEST_HEADERS.host", "example.com");
            assert!(limiter.evaluate(1, &mut tx).allowed);
            assert!(tx.interruption().is_none());
        }

        let mut tx = AttributeMap::new().with("REQUEST_HEADERS.host", "example.com");
        let verdict = limiter.evaluate(1, &mut tx);
        assert_eq!(
            verdict,
            Verdict {
                allowed: false,
                action: Action::Deny,
                status: 403,
            }
        );
        assert_eq!(
            tx.interruption(),
            Some(Interruption {
                rule_id: 1,
                action: Action::Deny,
                status: 403,
            })
        );

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_multi_zone_or() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter(
            "zone[]=a&zone[]=b&events=2&window=10&action=redirect&status=302",
            clock,
        );

        assert!(limiter.decide(&["a1", "b1"], NOW).allowed);
        assert!(limiter.decide(&["a1", "b1"], NOW).allowed);
        // a1 exhausted, b2 fresh
        assert!(limiter.decide(&["a1", "b2"], NOW).allowed);
        assert_eq!(limiter.store().window_sum("a1", NOW, 10), 2);
        assert_eq!(limiter.store().window_sum("b2", NOW, 10), 1);

        // Both exhausted
        let verdict = limiter.decide(&["a1", "b1"], NOW);
        assert!(verdict.is_denied());
        assert_eq!(verdict.action, Action::Redirect);
        assert_eq!(verdict.status, 302);

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_passing_selectors_are_all_charged() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter("zone[]=a&zone[]=b&events=3&window=10", clock);

        limiter.decide(&["x", "y"], NOW);
        assert_eq!(limiter.store().window_sum("x", NOW, 10), 1);
        assert_eq!(limiter.store().window_sum("y", NOW, 10), 1);

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_four_partition_scenario() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter(
            "zone[]=%{REQUEST_HEADERS.host}&zone[]=%{QUERY_STRING}&events=11&window=1",
            clock,
        );

        let mut denied = Vec::new();
        for i in 0..48 {
            let mut tx = AttributeMap::new()
                .with("REQUEST_HEADERS.host", "example.com")
                .with("QUERY_STRING", format!("id=1&category={}", i % 4));
            if limiter.evaluate(1, &mut tx).is_denied() {
                denied.push(i);
            }
        }

        // The last event of each partition is its 12th
        assert_eq!(denied, vec![44, 45, 46, 47]);
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_key_uses_fallback_zone() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter("zone[]=%{REQUEST_HEADERS.host}&events=1&window=5", clock);

        let mut tx = AttributeMap::new();
        assert!(limiter.evaluate(7, &mut tx).allowed);
        assert_eq!(limiter.store().window_sum("misc", NOW, 5), 1);

        let mut tx = AttributeMap::new().with("REQUEST_HEADERS.host", "");
        assert!(limiter.evaluate(7, &mut tx).is_denied());

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_events_blocks_everything() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter("zone[]=h&events=0&window=1", clock);
        assert!(limiter.decide(&["h"], NOW).is_denied());
        assert_eq!(limiter.store().zone_count(), 0);
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_directive_does_not_start() {
        let result =
            ZoneLimiter::from_directive("zone[]=h&window=1", &NoGroupKey, LimiterDeps::default());
        assert!(matches!(result, Err(ZonelimitError::Directive(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_parameters_never_reach_a_limiter() {
        for directive in [
            "zone[]=h&events=1&window=0",
            "zone[]=h&events=1&window=1&interval=0",
            "zone[]=h&events=1&window=1&status=9999",
            "zone[]=h&events=1&window=1&status=-1",
        ] {
            let result =
                ZoneLimiter::from_directive(directive, &NoGroupKey, LimiterDeps::default());
            assert!(
                matches!(result, Err(ZonelimitError::Directive(_))),
                "{} should be rejected",
                directive
            );
        }

        // A config can only come from parsing, so `start` sees validated values
        let config = LimiterConfig::parse("zone[]=h&events=1&window=1", &NoGroupKey).unwrap();
        let limiter = ZoneLimiter::start(config, LimiterDeps::default()).unwrap();
        assert_eq!(limiter.config().window_secs(), 1);
        assert_eq!(limiter.config().sweep_interval_secs(), DEFAULT_SWEEP_INTERVAL_SECS);
        assert!(limiter.decide(&["h"], NOW).allowed);
        assert!(limiter.decide(&["h"], NOW).is_denied());
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_distributed_requires_shared_store() {
        let result = ZoneLimiter::from_directive(
            "zone[]=h&events=5&window=6&distribute_interval=5",
            &StaticGroupKey::new("abcdefgh12345678"),
            LimiterDeps::default(),
        );
        assert!(matches!(result, Err(ZonelimitError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_zones() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter("zone[]=h&events=5&window=1&interval=2", clock.clone());

        limiter.decide(&["a"], NOW);
        limiter.decide(&["b"], NOW);
        assert_eq!(limiter.store().zone_count(), 2);

        clock.advance(5);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(limiter.store().zone_count(), 0);

        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributed_limiters_share_budget() {
        let clock = Arc::new(ManualClock::new(NOW));
        let shared: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let group_key = StaticGroupKey::new("abcdefgh12345678");
        let directive = "zone[]=fixed&events=5&window=6&interval=10&distribute_interval=5";

        let deps = LimiterDeps::default()
            .with_clock(clock.clone())
            .with_shared_store(shared.clone());
        let first = ZoneLimiter::from_directive(directive, &group_key, deps.clone()).unwrap();
        let second = ZoneLimiter::from_directive(
            directive,
            &group_key,
            deps.with_cancel(CancellationToken::new()),
        )
        .unwrap();

        // Let the startup sync of both instances run
        tokio::time::sleep(Duration::from_millis(10)).await;

        clock.advance(1);
        for _ in 0..3 {
            assert!(first.decide(&["fixed"], NOW + 1).allowed);
        }

        // Next cycle: first publishes, then second picks it up on the one after
        clock.advance(1);
        first.sync_agent().unwrap().sync_once().await.unwrap();
        second.sync_agent().unwrap().sync_once().await.unwrap();

        assert_eq!(second.store().window_sum("fixed", NOW + 2, 6), 3);
        assert!(second.decide(&["fixed"], NOW + 2).allowed);
        assert!(second.decide(&["fixed"], NOW + 2).allowed);
        assert!(second.decide(&["fixed"], NOW + 2).is_denied());

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_deterministic() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter("zone[]=h&events=5&window=1&interval=1", clock);
        tokio::time::timeout(Duration::from_secs(1), limiter.shutdown())
            .await
            .expect("background tasks stop on cancel");
    }

    #[tokio::test]
    async fn test_host_cancel_token_stops_limiter() {
        let clock = Arc::new(ManualClock::new(NOW));
        let host_cancel = CancellationToken::new();
        let deps = LimiterDeps::default()
            .with_clock(clock)
            .with_cancel(host_cancel.clone());
        let limiter = ZoneLimiter::from_directive("zone[]=h&events=5&window=1", &NoGroupKey, deps)
            .unwrap();

        host_cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), limiter.tasks.wait())
            .await
            .expect("parent cancellation reaches the limiter");
    }
}
