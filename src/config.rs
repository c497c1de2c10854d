//! Repository configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// When pending changes are written to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only an explicit `flush()` writes.
    #[default]
    Manual,
    /// Pending changes are also flushed before each named query that runs
    /// outside a read-only scope.
    Auto,
}

/// What a single-instance lookup does when several rows match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipleResultPolicy {
    /// Return the first match in result order.
    #[default]
    First,
    /// Fail with `NON_UNIQUE_RESULT`.
    Reject,
}

/// Configuration for a repository (one unit of work).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Reject every write, as if permanently inside a read-only scope.
    pub read_only: bool,

    pub flush_mode: FlushMode,

    pub multiple_results: MultipleResultPolicy,

    /// Broadcast channel capacity for events.
    pub event_capacity: usize,

    /// How many recent events to keep for `recent_events`.
    pub max_recent_events: usize,

    /// Custom options (engine-specific)
    pub options: HashMap<String, serde_json::Value>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            flush_mode: FlushMode::Manual,
            multiple_results: MultipleResultPolicy::First,
            event_capacity: 256,
            max_recent_events: 100,
            options: HashMap::new(),
        }
    }
}

impl RepositoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set read-only mode
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn multiple_results(mut self, policy: MultipleResultPolicy) -> Self {
        self.multiple_results = policy;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn max_recent_events(mut self, max: usize) -> Self {
        self.max_recent_events = max;
        self
    }

    /// Add a custom option
    pub fn option(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.options.insert(key.into(), v);
        }
        self
    }

    /// Get a custom option
    pub fn get_option<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RepositoryConfig::default();
        assert!(!config.read_only);
        assert_eq!(config.flush_mode, FlushMode::Manual);
        assert_eq!(config.multiple_results, MultipleResultPolicy::First);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RepositoryConfig =
            serde_json::from_str(r#"{"flush_mode": "auto", "multiple_results": "reject"}"#)
                .unwrap();
        assert_eq!(config.flush_mode, FlushMode::Auto);
        assert_eq!(config.multiple_results, MultipleResultPolicy::Reject);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_options() {
        let config = RepositoryConfig::new()
            .read_only(true)
            .option("fetch_size", 50);
        assert!(config.read_only);
        assert_eq!(config.get_option::<u32>("fetch_size"), Some(50));
        assert_eq!(config.get_option::<u32>("missing"), None);
    }
}
