//! Zone rate limiting logic and state management.

pub mod backend;
pub mod clock;
mod counter;
pub mod directive;
pub mod distributed;
pub mod host;
mod limiter;
pub mod selector;
mod sweeper;

pub use backend::{LockLease, MemoryStore, RetryPolicy, SharedStore, StoreError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{normalize_zone, ZoneStore, ZoneTable, ZoneTimeline, FALLBACK_ZONE};
pub use directive::{
    Action, ConfigError, DistributedConfig, EnvGroupKey, GroupKeySource, LimiterConfig,
    NoGroupKey, StaticGroupKey,
};
pub use distributed::SyncAgent;
pub use host::{AttributeMap, Interruption, Transaction};
pub use limiter::{LimiterDeps, Verdict, ZoneLimiter};
pub use selector::{SelectorError, ZoneSelector};
pub use sweeper::Sweeper;
