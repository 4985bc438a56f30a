//! Device state tree
//!
//! Poll results are written here keyed by (device, node, property). The
//! bridge only writes; readers are the consumers of the state.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

/// Location of one value in the device state tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StateKey {
    /// Engine (or other device) id
    pub device: String,
    /// Node path, empty for device-level values
    pub node: String,
    /// Property path
    pub property: String,
}

impl StateKey {
    pub fn new(
        device: impl Into<String>,
        node: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            node: node.into(),
            property: property.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.node, self.property)
    }
}

/// Sink for recognized device state
pub trait StateStore: Send + Sync {
    fn write(&self, key: StateKey, value: Value);
}

/// State store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<BTreeMap<StateKey, Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StateKey) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every entry, ordered by key
    pub fn snapshot(&self) -> BTreeMap<StateKey, Value> {
        self.entries.read().clone()
    }

    /// Entries belonging to one device
    pub fn device(&self, device: &str) -> BTreeMap<StateKey, Value> {
        self.entries
            .read()
            .iter()
            .filter(|(key, _)| key.device == device)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl StateStore for InMemoryStateStore {
    fn write(&self, key: StateKey, value: Value) {
        self.entries.write().insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_display() {
        let key = StateKey::new("3", "Mixer_0", "Transform//Position/0");
        assert_eq!(key.to_string(), "3/Mixer_0/Transform//Position/0");
        assert_eq!(StateKey::new("3", "", "name").to_string(), "3//name");
    }

    #[test]
    fn test_write_overwrites() {
        let store = InMemoryStateStore::new();
        let key = StateKey::new("1", "", "status");

        store.write(key.clone(), json!("idle"));
        store.write(key.clone(), json!("running"));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key), Some(json!("running")));
    }

    #[test]
    fn test_device_filter_and_clear() {
        let store = InMemoryStateStore::new();
        store.write(StateKey::new("1", "", "name"), json!("Engine A"));
        store.write(StateKey::new("2", "", "name"), json!("Engine B"));
        store.write(StateKey::new("1", "", "ip"), json!("10.0.0.1"));

        assert_eq!(store.device("1").len(), 2);
        assert_eq!(store.snapshot().len(), 3);

        store.clear();
        assert!(store.is_empty());
    }
}
