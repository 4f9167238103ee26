//! Key/value storage trait and its backends.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::db::Database;
use crate::error::CacheError;

/// Trait for persistent key/value storage backends.
///
/// This is the narrow contract the rest of the crate needs from device
/// storage: byte values addressed by string keys.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;

  /// Remove `key`. Removing a missing key is not an error.
  fn delete(&self, key: &str) -> Result<(), CacheError>;

  /// List every stored key.
  fn keys(&self) -> Result<Vec<String>, CacheError>;

  /// Store several values at once. Backends that can should apply all or none.
  fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<(), CacheError> {
    for (key, value) in entries {
      self.set(key, value)?;
    }
    Ok(())
  }

  /// Remove several keys at once.
  fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
    for key in keys {
      self.delete(key)?;
    }
    Ok(())
  }
}

/// Storage implementation that doesn't store anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &[u8]) -> Result<(), CacheError> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<(), CacheError> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, CacheError> {
    Ok(Vec::new())
  }
}

/// In-process storage, lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
    let mut entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), CacheError> {
    let mut entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
    entries.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, CacheError> {
    let entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
    Ok(entries.keys().cloned().collect())
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default data directory location.
  pub fn open(path: Option<&std::path::Path>) -> Result<Self, CacheError> {
    Ok(Self::from_database(Database::open(path)?))
  }

  /// Open an in-memory store (tests, ephemeral runs).
  pub fn in_memory() -> Result<Self, CacheError> {
    Ok(Self::from_database(Database::open_in_memory()?))
  }

  fn from_database(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let conn = self.conn.lock().map_err(|_| CacheError::LockPoisoned)?;

    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get::<_, Vec<u8>>(0),
      )
      .optional()?;

    Ok(value)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
    let conn = self.conn.lock().map_err(|_| CacheError::LockPoisoned)?;

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), CacheError> {
    let conn = self.conn.lock().map_err(|_| CacheError::LockPoisoned)?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, CacheError> {
    let conn = self.conn.lock().map_err(|_| CacheError::LockPoisoned)?;

    let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(keys)
  }

  fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<(), CacheError> {
    let mut conn = self.conn.lock().map_err(|_| CacheError::LockPoisoned)?;

    let tx = conn.transaction()?;
    for (key, value) in entries {
      tx.execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )?;
    }
    tx.commit()?;

    Ok(())
  }

  fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
    let mut conn = self.conn.lock().map_err(|_| CacheError::LockPoisoned)?;

    let tx = conn.transaction()?;
    for key in keys {
      tx.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    }
    tx.commit()?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(store: &dyn KeyValueStore) {
    assert_eq!(store.get("a").unwrap(), None);

    store.set("a", b"1").unwrap();
    store.set("b", b"2").unwrap();
    store.set("a", b"3").unwrap();
    assert_eq!(store.get("a").unwrap().as_deref(), Some(&b"3"[..]));
    assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

    store.delete("a").unwrap();
    store.delete("a").unwrap();
    assert_eq!(store.get("a").unwrap(), None);

    store.delete_many(&["b".to_string()]).unwrap();
    assert!(store.keys().unwrap().is_empty());

    store
      .set_many(&[("c".to_string(), b"4".to_vec()), ("d".to_string(), b"5".to_vec())])
      .unwrap();
    assert_eq!(store.get("c").unwrap().as_deref(), Some(&b"4"[..]));
    assert_eq!(store.get("d").unwrap().as_deref(), Some(&b"5"[..]));
  }

  #[test]
  fn test_sqlite_store() {
    exercise(&SqliteStore::in_memory().unwrap());
  }

  #[test]
  fn test_memory_store() {
    exercise(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    SqliteStore::open(Some(&path))
      .unwrap()
      .set("settings_api_base_url", b"http://example.com/")
      .unwrap();

    let reopened = SqliteStore::open(Some(&path)).unwrap();
    assert_eq!(
      reopened.get("settings_api_base_url").unwrap().as_deref(),
      Some(&b"http://example.com/"[..])
    );
  }

  #[test]
  fn test_noop_store_always_misses() {
    let store = NoopStore;
    store.set("a", b"1").unwrap();
    assert_eq!(store.get("a").unwrap(), None);
  }
}
