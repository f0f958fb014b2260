//! Simple key-value store state machine.
//!
//! Commands are UTF-8 text:
//! - `SET key value` - set a key, returns empty output
//! - `DELETE key` - delete a key, returns empty output or `Err("NOT_FOUND")`
//!
//! For reads, use [`KeyValueStore::get`] directly on the shared handle
//! (reads bypass the replicated log).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ApplyResult, Snapshotable, StateMachine};

/// Simple in-memory key-value store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore { data: HashMap::new() }
    }

    /// Get a value directly (read-only, bypasses the log).
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Get all key-value pairs.
    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

/// Shared key-value store usable both as the node's state machine and for
/// direct reads.
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.lock().apply(command)
    }
}

impl Snapshotable for SharedKvStore {
    fn snapshot(&self) -> Result<Bytes, String> {
        self.lock().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.lock().restore(data)
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        let command = std::str::from_utf8(command)
            .map_err(|_| "command is not valid UTF-8".to_string())?;
        let parts: Vec<&str> = command.splitn(3, ' ').collect();

        match parts.as_slice() {
            ["SET", key, value] => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(Bytes::new())
            }
            ["DELETE", key] => {
                if self.data.remove(*key).is_some() {
                    Ok(Bytes::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
            _ => Err(format!("unknown command: {}", command)),
        }
    }
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Result<Bytes, String> {
        serde_json::to_vec(&self.data)
            .map(Bytes::from)
            .map_err(|e| format!("snapshot serialization failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.data = serde_json::from_slice(data)
            .map_err(|e| format!("snapshot deserialization failed: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET foo bar").unwrap();
        assert_eq!(kv.get("foo"), Some("bar".to_string()));
    }

    #[test]
    fn delete() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET foo bar").unwrap();
        kv.apply(b"DELETE foo").unwrap();
        assert_eq!(kv.get("foo"), None);
    }

    #[test]
    fn delete_not_found() {
        let mut kv = KeyValueStore::new();
        assert_eq!(kv.apply(b"DELETE nonexistent"), Err("NOT_FOUND".to_string()));
    }

    #[test]
    fn value_with_spaces() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET greeting hello world").unwrap();
        assert_eq!(kv.get("greeting"), Some("hello world".to_string()));
    }

    #[test]
    fn unknown_command() {
        let mut kv = KeyValueStore::new();
        let result = kv.apply(b"INVALID command");
        assert!(result.unwrap_err().contains("unknown command"));
    }

    #[test]
    fn snapshot_then_restore_yields_equivalent_store() {
        let mut kv1 = KeyValueStore::new();
        kv1.apply(b"SET key1 value1").unwrap();
        kv1.apply(b"SET key2 value2").unwrap();
        let snapshot = kv1.snapshot().unwrap();

        let mut kv2 = KeyValueStore::new();
        kv2.apply(b"SET stale data").unwrap();
        kv2.restore(&snapshot).unwrap();

        assert_eq!(kv2.get("key1"), Some("value1".to_string()));
        assert_eq!(kv2.get("key2"), Some("value2".to_string()));
        assert_eq!(kv2.get("stale"), None);
    }

    #[test]
    fn restore_invalid_data() {
        let mut kv = KeyValueStore::new();
        let result = kv.restore(b"invalid json data");
        assert!(result.unwrap_err().contains("deserialization failed"));
    }
}
