//! Host storage abstraction.
//!
//! The replica persists through a narrow key/value interface the host app
//! provides (IndexedDB, a mobile keystore, sqlite — the core does not care).
//! Values are JSON. `update` is a compare-and-swap: no concurrent caller may
//! interleave with the closure.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()>;
    /// Atomic read-modify-write. The closure sees the current value (if any)
    /// and returns the replacement.
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
}

/// Typed helpers layered over the JSON interface.
pub trait KvStoreExt: KvStore {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// In-memory store for tests and ephemeral embedding.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let entries = self.entries.lock();
        Ok(keys.iter().map(|k| entries.get(k).cloned()).collect())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut map = self.entries.lock();
        for (k, v) in entries {
            map.insert(k, v);
        }
        Ok(())
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<()> {
        // The lock spans the closure, which is what makes this a CAS.
        let mut map = self.entries.lock();
        let current = map.get(key).cloned();
        let next = f(current);
        map.insert(key.to_string(), next);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Map a storage backend error into the shared taxonomy.
pub fn storage_error(e: impl std::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_is_read_modify_write() {
        let store = MemoryStore::new();
        store.set("n", json!(1)).unwrap();
        store
            .update("n", &mut |v| {
                let n = v.and_then(|v| v.as_i64()).unwrap_or(0);
                json!(n + 1)
            })
            .unwrap();
        assert_eq!(store.get("n").unwrap(), Some(json!(2)));
    }

    #[test]
    fn get_many_preserves_positions() {
        let store = MemoryStore::new();
        store.set("a", json!("x")).unwrap();
        let out = store.get_many(&["a".into(), "missing".into()]).unwrap();
        assert_eq!(out, vec![Some(json!("x")), None]);
    }

    #[test]
    fn typed_roundtrip() {
        let store = MemoryStore::new();
        store.set_as("peer", &vec!["a", "b"]).unwrap();
        let back: Vec<String> = store.get_as("peer").unwrap().unwrap();
        assert_eq!(back, vec!["a", "b"]);
    }
}
