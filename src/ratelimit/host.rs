//! The surface a host inspection engine exposes to the limiter.

use std::collections::HashMap;

use super::directive::Action;
use super::selector::ZoneSelector;

/// Instruction to the host to stop a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interruption {
    pub rule_id: u64,
    pub action: Action,
    pub status: u16,
}

/// One intercepted transaction as seen by the limiter.
pub trait Transaction {
    /// Expand `selector` against this transaction. May return an empty string.
    fn resolve_zone_key(&self, selector: &ZoneSelector) -> String;

    /// Ask the host to interrupt this transaction.
    fn interrupt(&mut self, interruption: Interruption);
}

/// A transaction backed by a flat attribute map.
///
/// Attributes are keyed by `COLLECTION` or `COLLECTION.key`, matching how
/// selectors reference them: `%{REMOTE_ADDR}` looks up `REMOTE_ADDR` and
/// `%{REQUEST_HEADERS.host}` looks up `REQUEST_HEADERS.host`.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    attributes: HashMap<String, String>,
    interruption: Option<Interruption>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn get(&self, collection: &str, key: Option<&str>) -> Option<&str> {
        let value = match key {
            Some(key) => self.attributes.get(&format!("{}.{}", collection, key)),
            None => self.attributes.get(collection),
        };
        value.map(String::as_str)
    }

    /// The interruption recorded by the limiter, if any.
    pub fn interruption(&self) -> Option<Interruption> {
        self.interruption
    }

    /// Parse whitespace-separated `NAME=value` pairs; tokens without `=` are ignored.
    pub fn from_line(line: &str) -> Self {
        let mut map = Self::new();
        for (name, value) in line.split_whitespace().filter_map(|t| t.split_once('=')) {
            map.insert(name, value);
        }
        map
    }
}

impl Transaction for AttributeMap {
    fn resolve_zone_key(&self, selector: &ZoneSelector) -> String {
        selector.expand(|collection, key| self.get(collection, key).map(str::to_string))
    }

    fn interrupt(&mut self, interruption: Interruption) {
        self.interruption = Some(interruption);
    }
}
