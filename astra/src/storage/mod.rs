//! Storage backends for astra
//!
//! Store snapshots live in a namespaced key-value table; archives and
//! exports are plain JSON/JSONL files.

mod jsonl;
mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

pub use jsonl::{export_json, import_json, JsonlStorage};
pub use sqlite::SqliteStorage;

/// A namespaced key-value record store holding serialized snapshots
pub trait KvStore: Send + Sync {
    /// Read the record stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write (or overwrite) the record stored under `key`
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the record stored under `key`
    fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile key-value store, used in tests and when no data dir is wanted
#[derive(Default)]
pub struct InMemoryStorage {
    records: Mutex<HashMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let records = self.records.lock().map_err(|e| Error::storage(e.to_string()))?;
        Ok(records.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut records = self.records.lock().map_err(|e| Error::storage(e.to_string()))?;
        records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut records = self.records.lock().map_err(|e| Error::storage(e.to_string()))?;
        records.remove(key);
        Ok(())
    }
}
