//! SQLite storage for store snapshots

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::KvStore;
use crate::config::Config;
use crate::error::{Error, Result};

/// SQLite storage backend
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the database under the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.sqlite_path())
    }

    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// List stored keys, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut stmt = conn.prepare("SELECT key FROM kv_records ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        rows.collect::<std::result::Result<Vec<String>, _>>()
            .map_err(Error::from)
    }
}

impl KvStore for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.query_row(
            "SELECT value FROM kv_records WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO kv_records (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        conn.execute("DELETE FROM kv_records WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.put("astra-persona", r#"{"name":"A"}"#).unwrap();
            storage.put("astra-persona", r#"{"name":"B"}"#).unwrap();
            storage.put("astra-memories", "[]").unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            storage.get("astra-persona").unwrap().as_deref(),
            Some(r#"{"name":"B"}"#)
        );
        assert_eq!(storage.keys().unwrap(), vec!["astra-memories", "astra-persona"]);
    }

    #[test]
    fn delete_and_missing_keys() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.get("absent").unwrap().is_none());

        tokio_test::assert_ok!(storage.put("k", "v"));
        tokio_test::assert_ok!(storage.delete("k"));
        assert!(storage.get("k").unwrap().is_none());
    }
}
