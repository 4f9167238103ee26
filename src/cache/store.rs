//! Persistent cache store: timestamped values with expiry-aware reads.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::storage::KeyValueStore;
use super::traits::Clock;
use crate::error::CacheError;

/// Prefix for cached values in the key/value store.
pub const CACHE_PREFIX: &str = "api_cache_";
/// Prefix for the write timestamp of each cached value.
pub const TIMESTAMP_PREFIX: &str = "timestamp_";

/// A cached value together with the time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: T,
  pub stored_at_millis: i64,
}

impl<T> CacheEntry<T> {
  /// An entry is fresh iff `now - stored_at <= expiry`.
  pub fn is_fresh(&self, now_millis: i64, expiry: Duration) -> bool {
    now_millis - self.stored_at_millis <= expiry_millis(expiry)
  }
}

fn expiry_millis(expiry: Duration) -> i64 {
  i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX)
}

/// Namespaced, timestamped cache on top of a [`KeyValueStore`].
///
/// Every method reports storage trouble as a [`CacheError`]; deciding to
/// treat that as a miss is up to the caller.
#[derive(Clone)]
pub struct CacheStore {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }

  pub fn now_millis(&self) -> i64 {
    self.clock.now_millis()
  }

  fn value_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
  }

  fn timestamp_key(key: &str) -> String {
    format!("{}{}", TIMESTAMP_PREFIX, key)
  }

  /// Return the stored value if it is still fresh.
  ///
  /// An expired entry is evicted and reported as absent.
  pub fn get<T: DeserializeOwned>(
    &self,
    key: &str,
    expiry: Duration,
  ) -> Result<Option<T>, CacheError> {
    let Some(entry) = self.peek::<T>(key)? else {
      debug!(key, "cache miss");
      return Ok(None);
    };

    if !entry.is_fresh(self.now_millis(), expiry) {
      debug!(key, "cache entry expired");
      self.delete(key)?;
      return Ok(None);
    }

    debug!(key, "cache hit");
    Ok(Some(entry.value))
  }

  /// Read an entry regardless of its age.
  pub fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, CacheError> {
    let Some(stored_at_millis) = self.stored_at(key)? else {
      return Ok(None);
    };
    let Some(bytes) = self.store.get(&Self::value_key(key))? else {
      return Ok(None);
    };

    let value = serde_json::from_slice(&bytes).map_err(|source| CacheError::Deserialize {
      key: key.to_string(),
      source,
    })?;

    Ok(Some(CacheEntry {
      key: key.to_string(),
      value,
      stored_at_millis,
    }))
  }

  /// Timestamp of the entry under `key`, if any.
  pub fn stored_at(&self, key: &str) -> Result<Option<i64>, CacheError> {
    let Some(raw) = self.store.get(&Self::timestamp_key(key))? else {
      return Ok(None);
    };

    let text = String::from_utf8_lossy(&raw);
    text
      .trim()
      .parse::<i64>()
      .map(Some)
      .map_err(|_| CacheError::Timestamp {
        key: key.to_string(),
        value: text.into_owned(),
      })
  }

  /// Store `value` stamped with the current time.
  pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
    self.write(key, value, self.now_millis())
  }

  /// Store `value` stamped with `stored_at_millis`, unless the entry already
  /// present was written later.
  ///
  /// Returns whether the write was applied.
  pub fn set_if_newer<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    stored_at_millis: i64,
  ) -> Result<bool, CacheError> {
    if let Some(existing) = self.stored_at(key)? {
      if existing > stored_at_millis {
        debug!(key, existing, stored_at_millis, "dropping out-of-order cache write");
        return Ok(false);
      }
    }

    self.write(key, value, stored_at_millis)?;
    Ok(true)
  }

  fn write<T: Serialize>(&self, key: &str, value: &T, stored_at_millis: i64) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Serialize {
      key: key.to_string(),
      source,
    })?;

    // Without a timestamp the entry reads as absent, so a write that fails
    // halfway never pairs the new value with the old time.
    let timestamp_key = Self::timestamp_key(key);
    self.store.delete(&timestamp_key)?;
    self.store.set_many(&[
      (Self::value_key(key), bytes),
      (timestamp_key, stored_at_millis.to_string().into_bytes()),
    ])?;

    debug!(key, "stored cache entry");
    Ok(())
  }

  /// Remove the entry under `key`. Idempotent.
  pub fn delete(&self, key: &str) -> Result<(), CacheError> {
    self.store.delete(&Self::value_key(key))?;
    self.store.delete(&Self::timestamp_key(key))?;
    Ok(())
  }

  /// Remove every cache entry, leaving other keys in the store untouched.
  ///
  /// Returns the number of storage keys removed.
  pub fn clear_all(&self) -> Result<usize, CacheError> {
    let keys: Vec<String> = self
      .store
      .keys()?
      .into_iter()
      .filter(|k| k.starts_with(CACHE_PREFIX) || k.starts_with(TIMESTAMP_PREFIX))
      .collect();

    if !keys.is_empty() {
      self.store.delete_many(&keys)?;
    }

    debug!(removed = keys.len(), "cleared cache");
    Ok(keys.len())
  }
}
