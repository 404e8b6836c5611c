//! Process-level configuration for zonelimit.
//!
//! Per-rule limits come from directive strings (see [`crate::ratelimit::directive`]);
//! this module only covers settings shared by every limiter in the process.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ZonelimitError};

/// Environment variable prefix for layered overrides, e.g. `ZONELIMIT__SYNC__LOCK_LEASE_MS`.
const ENV_PREFIX: &str = "ZONELIMIT";

/// Main configuration for the zonelimit process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZonelimitConfig {
    /// Distributed sync configuration
    #[serde(default)]
    pub sync: SyncSettings,

    /// Where the instance-group key is read from
    #[serde(default)]
    pub group_key: GroupKeySettings,
}

/// Settings for the distributed lock used by the sync agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Lease after which a held lock expires on its own
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,

    /// Maximum number of acquisition attempts per sync cycle
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    /// Linear backoff step between acquisition attempts
    #[serde(default = "default_lock_retry_backoff_ms")]
    pub lock_retry_backoff_ms: u64,

    /// Prefix joined with the group key to name the lock
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lock_lease_ms: default_lock_lease_ms(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_backoff_ms: default_lock_retry_backoff_ms(),
            lock_prefix: default_lock_prefix(),
        }
    }
}

impl SyncSettings {
    /// Lock lease as a `Duration`.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// Backoff step as a `Duration`.
    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    /// Name of the lock guarding `group_key`.
    pub fn lock_name(&self, group_key: &str) -> String {
        format!("{}{}", self.lock_prefix, group_key)
    }
}

fn default_lock_lease_ms() -> u64 {
    1500
}

fn default_lock_retry_attempts() -> u32 {
    50
}

fn default_lock_retry_backoff_ms() -> u64 {
    60
}

fn default_lock_prefix() -> String {
    "lock_".to_string()
}

/// Source of the out-of-band instance-group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeySettings {
    /// Environment variable holding the key
    #[serde(default = "default_group_key_env")]
    pub env: String,
}

impl Default for GroupKeySettings {
    fn default() -> Self {
        Self {
            env: default_group_key_env(),
        }
    }
}

fn default_group_key_env() -> String {
    "ZONELIMIT_GROUP_KEY".to_string()
}

impl ZonelimitConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ZonelimitError::Config(e.to_string()))
    }

    /// Load defaults, then an optional file, then `ZONELIMIT__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| ZonelimitError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ZonelimitError::Config(e.to_string()))
    }
}
