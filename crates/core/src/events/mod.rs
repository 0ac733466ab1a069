//! Event envelope passed between producers, the runner and agents
//!
//! An [`Event`] is safe to share between tasks: every accessor returns an
//! owned copy and every mutator takes the internal lock, so a reader never
//! observes a half-applied update.

use crate::*;
use parking_lot::RwLock;
use serde::{Deserializer, Serializer};
use std::collections::HashMap;
use std::fmt;

pub mod keys;

pub use keys::*;

/// Event payload: late-bound values keyed by name
pub type EventData = HashMap<String, serde_json::Value>;

/// Event metadata: routing and session strings keyed by name
pub type EventMetadata = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EventRecord {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    target_agent_id: String,
    #[serde(default)]
    source_agent_id: String,
    #[serde(default)]
    data: EventData,
    #[serde(default)]
    metadata: EventMetadata,
}

/// Message envelope dispatched through the runtime
pub struct Event {
    record: RwLock<EventRecord>,
}

impl Event {
    /// Create event with a fresh unique id and the current timestamp
    pub fn new(target_agent_id: impl Into<String>, data: EventData, metadata: EventMetadata) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), target_agent_id, data, metadata)
    }

    /// Create event with a caller-supplied id
    pub fn with_id(
        id: impl Into<String>,
        target_agent_id: impl Into<String>,
        data: EventData,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            record: RwLock::new(EventRecord {
                id: id.into(),
                timestamp: Utc::now(),
                target_agent_id: target_agent_id.into(),
                source_agent_id: String::new(),
                data,
                metadata,
            }),
        }
    }

    /// Create event addressed to `route` through the route metadata key
    pub fn routed(route: impl Into<String>, data: EventData) -> Self {
        let route = route.into();
        let mut metadata = EventMetadata::new();
        metadata.insert(MetadataKeys::ROUTE.to_string(), route.clone());
        Self::new(route, data, metadata)
    }

    pub fn id(&self) -> String {
        self.record.read().id.clone()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.read().timestamp
    }

    pub fn target_agent_id(&self) -> String {
        self.record.read().target_agent_id.clone()
    }

    pub fn source_agent_id(&self) -> String {
        self.record.read().source_agent_id.clone()
    }

    /// Copy of the whole payload
    pub fn data(&self) -> EventData {
        self.record.read().data.clone()
    }

    pub fn data_value(&self, key: &str) -> Option<serde_json::Value> {
        self.record.read().data.get(key).cloned()
    }

    /// Copy of the whole metadata map
    pub fn metadata(&self) -> EventMetadata {
        self.record.read().metadata.clone()
    }

    pub fn metadata_value(&self, key: &str) -> Option<String> {
        self.record.read().metadata.get(key).cloned()
    }

    /// Value of the route metadata key, if present
    pub fn route(&self) -> Option<String> {
        self.metadata_value(MetadataKeys::ROUTE)
    }

    /// Value of the session metadata key, if present and non-empty
    pub fn session_id(&self) -> Option<String> {
        self.metadata_value(MetadataKeys::SESSION_ID)
            .filter(|session| !session.is_empty())
    }

    pub fn set_id(&self, id: impl Into<String>) {
        self.record.write().id = id.into();
    }

    pub fn set_target_agent_id(&self, target: impl Into<String>) {
        self.record.write().target_agent_id = target.into();
    }

    pub fn set_source_agent_id(&self, source: impl Into<String>) {
        self.record.write().source_agent_id = source.into();
    }

    pub fn set_data(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.record.write().data.insert(key.into(), value.into());
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.record.write().metadata.insert(key.into(), value.into());
    }

    pub fn remove_metadata(&self, key: &str) -> Option<String> {
        self.record.write().metadata.remove(key)
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        Self {
            record: RwLock::new(self.record.read().clone()),
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        *self.record.read() == *other.record.read()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.record.read();
        f.debug_struct("Event")
            .field("id", &record.id)
            .field("timestamp", &record.timestamp)
            .field("target_agent_id", &record.target_agent_id)
            .field("source_agent_id", &record.source_agent_id)
            .field("data", &record.data)
            .field("metadata", &record.metadata)
            .finish()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.record.read().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = EventRecord::deserialize(deserializer)?;
        Ok(Self {
            record: RwLock::new(record),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_new_event_has_unique_id_and_timestamp() {
        let before = Utc::now();
        let first = Event::new("agent", EventData::new(), EventMetadata::new());
        let second = Event::new("agent", EventData::new(), EventMetadata::new());

        assert_ne!(first.id(), second.id());
        assert!(!first.id().is_empty());
        assert!(first.timestamp() >= before);
        assert_eq!(first.target_agent_id(), "agent");
    }

    #[test]
    fn test_accessors_return_copies() {
        let mut data = EventData::new();
        data.insert("query".to_string(), json!("hello"));
        let event = Event::new("agent", data, EventMetadata::new());

        let mut copy = event.data();
        copy.insert("query".to_string(), json!("mutated"));
        copy.insert("extra".to_string(), json!(1));

        assert_eq!(event.data_value("query"), Some(json!("hello")));
        assert!(event.data_value("extra").is_none());

        let mut meta = event.metadata();
        meta.insert("route".to_string(), "elsewhere".to_string());
        assert!(event.route().is_none());
    }

    #[test]
    fn test_routed_event_sets_route_metadata() {
        let event = Event::routed("planner", EventData::new());
        assert_eq!(event.route().as_deref(), Some("planner"));
        assert_eq!(event.target_agent_id(), "planner");
        assert!(event.session_id().is_none());
    }

    #[test]
    fn test_clone_is_independent() {
        let event = Event::routed("a", EventData::new());
        let clone = event.clone();
        clone.set_metadata(MetadataKeys::ROUTE, "b");
        clone.set_data("k", 1);

        assert_eq!(event.route().as_deref(), Some("a"));
        assert!(event.data_value("k").is_none());
        assert_eq!(clone.route().as_deref(), Some("b"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_fields() {
        let event = Event::with_id("evt-1", "agent", EventData::new(), EventMetadata::new());
        event.set_source_agent_id("producer");
        event.set_metadata(MetadataKeys::SESSION_ID, "s-1");

        let json = serde_json::to_string(&event).expect("serialize event");
        let decoded: Event = serde_json::from_str(&json).expect("deserialize event");

        assert_eq!(decoded, event);
        assert_eq!(decoded.session_id().as_deref(), Some("s-1"));
    }

    #[test]
    fn test_concurrent_mutation_is_safe() {
        let event = Arc::new(Event::new("agent", EventData::new(), EventMetadata::new()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let event = event.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        event.set_metadata(format!("k{}-{}", i, j), "v");
                        let _ = event.metadata();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        assert_eq!(event.metadata().len(), 8 * 50);
    }
}
