//! Repository events for observability.
//!
//! Repositories publish an [`AccessEvent`] for every query, flush and clear.
//! Subscribers receive them over a broadcast channel; a bounded buffer keeps
//! the most recent ones for inspection.

use crate::context::ContextId;
use crate::errors::AccessError;
use crate::types::UniqueId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast;

/// Unique event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub UniqueId);

impl EventId {
    pub fn new() -> Self {
        Self(UniqueId::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt_{}", self.0)
    }
}

/// Event types emitted by repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventType {
    /// Named query executed.
    QueryExecuted {
        query: String,
        rows: usize,
        read_only: bool,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Named query failed.
    QueryFailed {
        query: String,
        error_code: String,
        error_message: String,
    },

    /// Pending changes written to storage.
    Flushed { written: usize, deleted: usize },

    /// Persistence context cleared.
    ContextCleared { detached: usize },
}

impl EventType {
    /// Stable name used by [`EventFilter`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryExecuted { .. } => "query_executed",
            Self::QueryFailed { .. } => "query_failed",
            Self::Flushed { .. } => "flushed",
            Self::ContextCleared { .. } => "context_cleared",
        }
    }
}

/// Event emitted by a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: EventId,

    /// Event type and data.
    #[serde(flatten)]
    pub event_type: EventType,

    pub timestamp: DateTime<Utc>,

    /// Context the event occurred in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,
}

impl AccessEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            timestamp: Utc::now(),
            context_id: None,
        }
    }

    pub fn in_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    // Event constructors

    pub fn query_executed(
        query: impl Into<String>,
        rows: usize,
        read_only: bool,
        duration: Duration,
    ) -> Self {
        Self::new(EventType::QueryExecuted {
            query: query.into(),
            rows,
            read_only,
            duration,
        })
    }

    pub fn query_failed(query: impl Into<String>, error: &AccessError) -> Self {
        Self::new(EventType::QueryFailed {
            query: query.into(),
            error_code: error.code.to_string(),
            error_message: error.message.clone(),
        })
    }

    pub fn flushed(written: usize, deleted: usize) -> Self {
        Self::new(EventType::Flushed { written, deleted })
    }

    pub fn context_cleared(detached: usize) -> Self {
        Self::new(EventType::ContextCleared { detached })
    }
}

/// Filter for subscribing to events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event type names (see [`EventType::name`]).
    pub event_types: Option<Vec<String>>,

    /// Filter by context.
    pub context_id: Option<ContextId>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, name: impl Into<String>) -> Self {
        self.event_types.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    pub fn in_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &AccessEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type.name()) {
                return false;
            }
        }

        if let Some(ctx) = &self.context_id {
            if event.context_id.as_ref() != Some(ctx) {
                return false;
            }
        }

        true
    }
}

/// Event receiver (broadcast channel).
pub type EventReceiver = broadcast::Receiver<AccessEvent>;

/// Event sender (broadcast channel).
pub type EventSender = broadcast::Sender<AccessEvent>;

/// Event emitter trait for observability.
pub trait EventEmitter {
    /// Subscribe to every event emitted from now on. Narrow live events with
    /// [`EventFilter::matches`].
    fn subscribe(&self) -> EventReceiver;

    /// Recent events matching the filter, newest first.
    fn recent_events(&self, filter: &EventFilter, limit: usize) -> Vec<AccessEvent>;
}

/// Helper struct for managing event emission.
pub struct EventManager {
    sender: EventSender,
    recent: Mutex<VecDeque<AccessEvent>>,
    max_recent: usize,
}

impl EventManager {
    /// Create a new event manager.
    pub fn new(capacity: usize, max_recent: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(max_recent)),
            max_recent,
        }
    }

    /// Emit an event.
    pub fn emit(&self, event: AccessEvent) {
        {
            let mut recent = self.recent.lock();
            recent.push_back(event.clone());
            while recent.len() > self.max_recent {
                recent.pop_front();
            }
        }

        // Broadcast (ignore errors if no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Get recent events, newest first.
    pub fn recent(&self, filter: &EventFilter, limit: usize) -> Vec<AccessEvent> {
        let recent = self.recent.lock();
        recent
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256, 100)
    }
}

// Duration serialization as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_filter() {
        let ctx = ContextId::new();
        let event = AccessEvent::flushed(2, 1).in_context(ctx);

        assert!(EventFilter::new().matches(&event));
        assert!(EventFilter::new().of_type("flushed").matches(&event));
        assert!(!EventFilter::new().of_type("query_failed").matches(&event));
        assert!(EventFilter::new().in_context(ctx).matches(&event));
        assert!(!EventFilter::new().in_context(ContextId::new()).matches(&event));
    }

    #[test]
    fn test_event_manager_bounds_recent() {
        let manager = EventManager::new(10, 2);
        manager.emit(AccessEvent::context_cleared(1));
        manager.emit(AccessEvent::context_cleared(2));
        manager.emit(AccessEvent::context_cleared(3));

        let recent = manager.recent(&EventFilter::new(), 10);
        assert_eq!(recent.len(), 2);
        assert!(matches!(
            recent[0].event_type,
            EventType::ContextCleared { detached: 3 }
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = AccessEvent::query_executed("Person.all", 4, false, Duration::from_millis(7));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "query_executed");
        assert_eq!(json["duration"], 7);
        assert_eq!(json["rows"], 4);
    }
}
