//! Rate limit directive parsing.
//!
//! A directive is the option string attached to a rule, in the form
//! `key=value(&key=value)*`, for example:
//!
//! ```text
//! zone[]=%{REQUEST_HEADERS.host}&zone[]=%{QUERY_STRING}&events=200&window=1&action=deny&status=403
//! ```
//!
//! Parsing is all-or-nothing: either a complete [`LimiterConfig`] comes back or
//! a [`ConfigError`] describing the first problem found.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::selector::{SelectorError, ZoneSelector};

/// Default sweep interval when `interval` is not given.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
/// Default status returned on denial.
pub const DEFAULT_STATUS: u16 = 429;
/// Highest accepted status code.
pub const MAX_STATUS: u16 = 500;
/// Minimum length of the instance-group key.
pub const MIN_GROUP_KEY_LEN: usize = 16;

/// Errors produced while parsing a directive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("empty option at position {0}")]
    EmptyToken(usize),
    #[error("malformed option {0:?}, expected key=value")]
    MalformedToken(String),
    #[error("unknown option {0:?}")]
    UnknownKey(String),
    #[error("option {0:?} given more than once")]
    DuplicateKey(String),
    #[error("missing required option {0:?}")]
    MissingKey(&'static str),
    #[error("invalid value {value:?} for {key:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("invalid zone selector {selector:?}: {source}")]
    InvalidSelector {
        selector: String,
        #[source]
        source: SelectorError,
    },
    #[error("distributed mode requires an instance-group key")]
    MissingGroupKey,
    #[error("instance-group key must be at least 16 alphanumeric characters with a letter and a digit")]
    InvalidGroupKey,
}

/// What the host should do with a denied transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    #[default]
    Drop,
    Deny,
    Redirect,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Drop => "drop",
            Action::Deny => "deny",
            Action::Redirect => "redirect",
        }
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Action::Drop),
            "deny" => Ok(Action::Deny),
            "redirect" => Ok(Action::Redirect),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cross-instance sync settings, present only in distributed mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    sync_interval_secs: u64,
    group_key: String,
}

impl DistributedConfig {
    /// Seconds between sync cycles, at least 1.
    pub fn sync_interval_secs(&self) -> u64 {
        self.sync_interval_secs
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Key shared by every instance of the group; names both the remote value and its lock.
    pub fn group_key(&self) -> &str {
        &self.group_key
    }
}

/// Immutable limiter parameters derived from a directive.
///
/// Only [`LimiterConfig::parse`] builds one, so every value seen through the
/// accessors has passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    selectors: Vec<ZoneSelector>,
    max_events: u64,
    window_secs: u64,
    sweep_interval_secs: u64,
    action: Action,
    status: u16,
    distributed: Option<DistributedConfig>,
}

impl LimiterConfig {
    /// Parse a directive, looking up the group key only if distributed mode is requested.
    pub fn parse<G: GroupKeySource + ?Sized>(
        directive: &str,
        group_key: &G,
    ) -> Result<Self, ConfigError> {
        parse(directive, group_key)
    }

    /// Zone selectors in directive order; never empty.
    pub fn selectors(&self) -> &[ZoneSelector] {
        &self.selectors
    }

    pub fn max_events(&self) -> u64 {
        self.max_events
    }

    /// Window length in seconds, at least 1.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.sweep_interval_secs
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Status reported on denial, within `0..=500`.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn distributed(&self) -> Option<&DistributedConfig> {
        self.distributed.as_ref()
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed.is_some()
    }
}

/// Supplies the out-of-band instance-group key.
pub trait GroupKeySource {
    fn group_key(&self) -> Option<String>;
}

/// No group key available; distributed directives fail to parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGroupKey;

impl GroupKeySource for NoGroupKey {
    fn group_key(&self) -> Option<String> {
        None
    }
}

/// Reads the group key from an environment variable at parse time.
#[derive(Debug, Clone)]
pub struct EnvGroupKey {
    var: String,
}

impl EnvGroupKey {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl GroupKeySource for EnvGroupKey {
    fn group_key(&self) -> Option<String> {
        std::env::var(&self.var).ok()
    }
}

/// A fixed group key, e.g. one loaded from a secrets file.
#[derive(Debug, Clone)]
pub struct StaticGroupKey(String);

impl StaticGroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl GroupKeySource for StaticGroupKey {
    fn group_key(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

impl<F> GroupKeySource for F
where
    F: Fn() -> Option<String>,
{
    fn group_key(&self) -> Option<String> {
        self()
    }
}

/// Check the group key shape: at least 16 ASCII alphanumerics, with a letter and a digit.
pub fn validate_group_key(key: &str) -> Result<(), ConfigError> {
    let valid = key.len() >= MIN_GROUP_KEY_LEN
        && key.chars().all(|c| c.is_ascii_alphanumeric())
        && key.chars().any(|c| c.is_ascii_alphabetic())
        && key.chars().any(|c| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidGroupKey)
    }
}

/// Parse a directive string into a [`LimiterConfig`].
pub fn parse<G: GroupKeySource + ?Sized>(
    directive: &str,
    group_key: &G,
) -> Result<LimiterConfig, ConfigError> {
    let mut selectors = Vec::new();
    let mut events = None;
    let mut window = None;
    let mut interval = None;
    let mut action = None;
    let mut status = None;
    let mut distribute_interval = None;

    for (position, token) in directive.split('&').enumerate() {
        if token.is_empty() {
            return Err(ConfigError::EmptyToken(position));
        }

        let mut parts = token.split('=');
        let (key, value) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(v), None) if !k.is_empty() && !v.is_empty() => (k, v),
            _ => return Err(ConfigError::MalformedToken(token.to_string())),
        };

        match key {
            "zone[]" => {
                let selector =
                    ZoneSelector::parse(value).map_err(|source| ConfigError::InvalidSelector {
                        selector: value.to_string(),
                        source,
                    })?;
                selectors.push(selector);
            }
            "events" => set_once(&mut events, key, parse_int(value, "events", 0)?)?,
            "window" => set_once(&mut window, key, parse_int(value, "window", 1)?)?,
            "interval" => set_once(&mut interval, key, parse_int(value, "interval", 1)?)?,
            "action" => {
                let parsed = value.parse::<Action>().map_err(|_| ConfigError::InvalidValue {
                    key: "action",
                    value: value.to_string(),
                    reason: "expected one of drop, deny, redirect",
                })?;
                set_once(&mut action, key, parsed)?;
            }
            "status" => set_once(&mut status, key, parse_status(value)?)?,
            "distribute_interval" => set_once(
                &mut distribute_interval,
                key,
                parse_int(value, "distribute_interval", 1)?,
            )?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
    }

    if selectors.is_empty() {
        return Err(ConfigError::MissingKey("zone[]"));
    }
    let max_events = events.ok_or(ConfigError::MissingKey("events"))?;
    let window_secs = window.ok_or(ConfigError::MissingKey("window"))?;

    let distributed = match distribute_interval {
        Some(sync_interval_secs) => {
            let key = group_key
                .group_key()
                .filter(|k| !k.is_empty())
                .ok_or(ConfigError::MissingGroupKey)?;
            validate_group_key(&key)?;
            Some(DistributedConfig {
                sync_interval_secs,
                group_key: key,
            })
        }
        None => None,
    };

    Ok(LimiterConfig {
        selectors,
        max_events,
        window_secs,
        sweep_interval_secs: interval.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        action: action.unwrap_or_default(),
        status: status.unwrap_or(DEFAULT_STATUS),
        distributed,
    })
}

fn set_once<T>(slot: &mut Option<T>, key: &str, value: T) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Err(ConfigError::DuplicateKey(key.to_string()));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_int(value: &str, key: &'static str, min: u64) -> Result<u64, ConfigError> {
    let parsed = value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: "expected a non-negative integer",
    })?;

    if parsed < min {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(parsed)
}

fn parse_status(value: &str) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: "status",
        value: value.to_string(),
        reason: "expected an integer between 0 and 500",
    };

    let parsed = value.parse::<i64>().map_err(|_| invalid())?;
    if !(0..=i64::from(MAX_STATUS)).contains(&parsed) {
        return Err(invalid());
    }
    u16::try_from(parsed).map_err(|_| invalid())
}
