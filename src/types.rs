//! Shared types used across the crate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A query argument value.
///
/// Arguments travel as JSON values so callers can bind strings, numbers,
/// booleans, timestamps and lists through one type.
pub type QueryValue = serde_json::Value;

/// Unique identifier (UUID-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueId(pub Uuid);

impl UniqueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids_differ() {
        let id = UniqueId::new();
        assert_ne!(id, UniqueId::new());
        assert_eq!(id.to_string(), id.0.to_string());
    }
}
