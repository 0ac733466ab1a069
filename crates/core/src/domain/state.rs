//! Mutable execution context handed from agent to agent

use crate::events::Event;
use crate::*;
use std::collections::HashMap;

/// Key/value execution state plus a parallel string metadata store
///
/// Values are `serde_json::Value` so agents can exchange arbitrary data
/// without agreeing on a single Rust type. `Clone` is deep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    meta: HashMap<String, String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create state seeded with payload values
    pub fn with_data(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data,
            meta: HashMap::new(),
        }
    }

    /// Fresh state holding a copy of the event payload and metadata
    pub fn from_event(event: &Event) -> Self {
        Self {
            data: event.data(),
            meta: event.metadata(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        self.meta.remove(key)
    }

    /// Data keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Metadata keys in sorted order
    pub fn meta_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.meta.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.meta.is_empty()
    }

    /// Union `other` into `self`; values from `other` win on collision
    pub fn merge(&mut self, other: &State) {
        for (key, value) in &other.data {
            self.data.insert(key.clone(), value.clone());
        }
        for (key, value) in &other.meta {
            self.meta.insert(key.clone(), value.clone());
        }
    }

    /// Union `other` into `self` with every key prefixed by `namespace.`
    pub fn merge_namespaced(&mut self, namespace: &str, other: &State) {
        for (key, value) in &other.data {
            self.data.insert(format!("{}.{}", namespace, key), value.clone());
        }
        for (key, value) in &other.meta {
            self.meta.insert(format!("{}.{}", namespace, key), value.clone());
        }
    }
}

impl From<HashMap<String, serde_json::Value>> for State {
    fn from(data: HashMap<String, serde_json::Value>) -> Self {
        Self::with_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, EventMetadata, MetadataKeys};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_set_get_and_meta() {
        let mut state = State::new();
        state.set("count", 3);
        state.set_meta(MetadataKeys::ROUTE, "planner");

        assert_eq!(state.get("count"), Some(&json!(3)));
        assert_eq!(state.get_meta("route"), Some("planner"));
        assert!(state.get("missing").is_none());
        assert_eq!(state.keys(), vec!["count".to_string()]);
        assert_eq!(state.meta_keys(), vec!["route".to_string()]);
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut base = State::new();
        base.set("a", 1);
        let mut other = State::new();
        other.set("a", 2);
        other.set_meta("m", "x");

        base.merge(&other);

        assert_eq!(base.get("a"), Some(&json!(2)));
        assert_eq!(base.get_meta("m"), Some("x"));
    }

    #[test]
    fn test_merge_namespaced_prefixes_keys() {
        let mut base = State::new();
        base.set("input", "q");
        let mut out = State::new();
        out.set("answer", 42);
        out.set_meta("route", "next");

        base.merge_namespaced("summarizer", &out);

        assert_eq!(base.get("input"), Some(&json!("q")));
        assert_eq!(base.get("summarizer.answer"), Some(&json!(42)));
        assert_eq!(base.get_meta("summarizer.route"), Some("next"));
        assert!(base.get("answer").is_none());
    }

    #[test]
    fn test_from_event_copies_data_and_metadata() {
        let mut data = EventData::new();
        data.insert("q".to_string(), json!("hi"));
        let mut meta = EventMetadata::new();
        meta.insert(MetadataKeys::SESSION_ID.to_string(), "s1".to_string());
        let event = Event::new("agent", data, meta);

        let mut state = State::from_event(&event);
        state.set("q", "changed");

        assert_eq!(state.get_meta(MetadataKeys::SESSION_ID), Some("s1"));
        assert_eq!(event.data_value("q"), Some(json!("hi")));
    }

    #[test]
    fn test_json_shape() {
        let mut state = State::new();
        state.set("k", "v");
        state.set_meta("m", "n");

        let value = serde_json::to_value(&state).expect("serialize state");
        assert_eq!(value, json!({"data": {"k": "v"}, "meta": {"m": "n"}}));

        let decoded: State = serde_json::from_value(value).expect("deserialize state");
        assert_eq!(decoded, state);
    }

    proptest! {
        #[test]
        fn prop_clone_is_independent(
            entries in proptest::collection::hash_map("[a-z]{1,6}", any::<i64>(), 0..12),
            key in "[a-z]{1,6}",
            value in any::<i64>(),
        ) {
            let mut original = State::new();
            for (k, v) in &entries {
                original.set(k.clone(), *v);
            }
            let snapshot = original.clone();

            let mut copy = original.clone();
            copy.set(key.clone(), value);
            copy.set_meta(key.clone(), "changed");
            copy.remove(&key);

            prop_assert_eq!(&original, &snapshot);
        }

        #[test]
        fn prop_merge_takes_other_on_collision(
            left in proptest::collection::hash_map("[a-c]", any::<i32>(), 0..4),
            right in proptest::collection::hash_map("[a-c]", any::<i32>(), 0..4),
        ) {
            let mut base = State::new();
            for (k, v) in &left {
                base.set(k.clone(), *v);
            }
            let mut other = State::new();
            for (k, v) in &right {
                other.set(k.clone(), *v);
            }

            base.merge(&other);

            for (k, v) in &right {
                prop_assert_eq!(base.get(k), Some(&json!(v)));
            }
            for (k, v) in &left {
                if !right.contains_key(k) {
                    prop_assert_eq!(base.get(k), Some(&json!(v)));
                }
            }
        }
    }
}
