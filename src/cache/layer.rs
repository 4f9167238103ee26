//! Cache layer that orchestrates caching logic with network fetching.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::{CacheEntry, CacheStore};
use super::traits::CacheResult;
use crate::error::{ApiError, FetchError};
use crate::retry::{retry_transient, RetryPolicy};

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// A network request currently running for one cache key.
struct InFlight {
  id: u64,
  future: SharedFetch,
}

/// Bookkeeping shared by every clone of the layer.
#[derive(Default)]
struct FetchState {
  next_id: u64,
  in_flight: HashMap<String, InFlight>,
  /// Start generation of every running request, detached ones included
  running: HashMap<u64, u64>,
  /// Bumped on every invalidation; requests remember the value they started at.
  generation: u64,
  invalidated_at: HashMap<String, u64>,
  cleared_at: u64,
}

impl FetchState {
  /// Whether a response to a request started at `started_gen` may still be cached.
  fn accepts_write(&self, key: &str, started_gen: u64) -> bool {
    self.cleared_at <= started_gen
      && self
        .invalidated_at
        .get(key)
        .map_or(true, |&invalidated| invalidated <= started_gen)
  }

  /// Forget invalidations that no running request started before.
  fn prune(&mut self) {
    match self.running.values().min().copied() {
      Some(oldest) => self.invalidated_at.retain(|_, &mut invalidated| invalidated > oldest),
      None => self.invalidated_at.clear(),
    }
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the repositories and the HTTP client, providing
/// cache-first reads, one network request per key at a time, retry with
/// backoff, and stale fallback while offline.
pub struct CacheLayer {
  cache: CacheStore,
  retry: RetryPolicy,
  state: Arc<Mutex<FetchState>>,
}

impl CacheLayer {
  /// Create a new cache layer on top of the given store.
  pub fn new(cache: CacheStore) -> Self {
    Self {
      cache,
      retry: RetryPolicy::reads(),
      state: Arc::new(Mutex::new(FetchState::default())),
    }
  }

  /// Set the retry policy for network reads.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.cache
  }

  fn state(&self) -> MutexGuard<'_, FetchState> {
    // The state holds no invariants a panicking holder could break halfway.
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Read an entry for the fetch decision. Storage problems count as a miss.
  fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    match self.cache.peek::<T>(key) {
      Ok(entry) => entry,
      Err(err) => {
        warn!(key, error = %err, "cache read failed, treating as miss");
        if let Err(err) = self.cache.delete(key) {
          warn!(key, error = %err, "failed to drop unreadable cache entry");
        }
        None
      }
    }
  }

  /// Fetch `key` with cache-first strategy.
  ///
  /// 1. Unless `force_refresh`, a fresh cache entry is returned immediately
  /// 2. Otherwise join the request already in flight for `key`, or start one
  /// 3. Transient failures are retried with backoff; a successful response is cached
  /// 4. When retries run out, any cached entry (even expired) is served instead
  pub async fn fetch_with_policy<T, F, Fut>(
    &self,
    key: &str,
    expiry: Duration,
    remote: F,
    force_refresh: bool,
  ) -> Result<CacheResult<T>, FetchError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let cached = self.lookup::<Value>(key);

    if let Some(entry) = &cached {
      if !force_refresh && entry.is_fresh(self.cache.now_millis(), expiry) {
        if let Ok(data) = serde_json::from_value::<T>(entry.value.clone()) {
          debug!(key, "serving fresh cache entry");
          return Ok(CacheResult::from_cache(data, entry.stored_at_millis));
        }
        warn!(key, "cached value has unexpected shape, refetching");
      }
    }

    let fetch = self.join_or_start(key, remote);

    match fetch.await {
      Ok(value) => {
        let data = decode(key, value)?;
        Ok(CacheResult::from_network(data))
      }
      Err(err) => {
        if err.api().is_some_and(ApiError::is_not_found) {
          self.invalidate(key);
          return Err(err);
        }

        if err.is_transient() {
          if let Some(entry) = cached {
            if let Ok(data) = serde_json::from_value::<T>(entry.value) {
              warn!(key, error = %err, "network unavailable, serving stale cache");
              return Ok(CacheResult::offline(data, entry.stored_at_millis));
            }
          }
        }

        Err(err)
      }
    }
  }

  /// Return the in-flight request for `key`, starting one if there is none.
  fn join_or_start<T, F, Fut>(&self, key: &str, remote: F) -> SharedFetch
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let mut state = self.state();

    if let Some(in_flight) = state.in_flight.get(key) {
      debug!(key, "joining in-flight request");
      return in_flight.future.clone();
    }

    let id = state.next_id;
    state.next_id += 1;
    let started_gen = state.generation;
    let started_at = self.cache.now_millis();
    state.running.insert(id, started_gen);

    let task = {
      let key = key.to_string();
      let cache = self.cache.clone();
      let shared_state = Arc::clone(&self.state);
      let retry = self.retry;

      async move {
        debug!(key = %key, "fetching from network");
        let result = retry_transient(&retry, &key, remote)
          .await
          .map_err(FetchError::from)
          .and_then(|data| {
            serde_json::to_value(&data).map_err(|e| FetchError::Decode {
              key: key.clone(),
              message: e.to_string(),
            })
          });

        let mut state = shared_state
          .lock()
          .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Ok(value) = &result {
          if state.accepts_write(&key, started_gen) {
            match cache.set_if_newer(&key, value, started_at) {
              Ok(true) => {}
              Ok(false) => debug!(key = %key, "newer cache entry already present"),
              Err(err) => warn!(key = %key, error = %err, "failed to write cache entry"),
            }
          } else {
            debug!(key = %key, "key invalidated while fetching, not caching response");
          }
        }

        if state.in_flight.get(&key).is_some_and(|f| f.id == id) {
          state.in_flight.remove(&key);
        }
        state.running.remove(&id);
        state.prune();

        result
      }
    };

    let handle = tokio::spawn(task);
    let aborted_key = key.to_string();
    let future = async move {
      handle
        .await
        .unwrap_or_else(|_| Err(FetchError::Aborted(aborted_key)))
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        future: future.clone(),
      },
    );

    future
  }

  /// Drop the cache entry for `key` so the next read goes to the network.
  ///
  /// A request already in flight for `key` is detached: its response is not
  /// cached and later callers start a new request.
  pub fn invalidate(&self, key: &str) {
    {
      let mut state = self.state();
      state.generation += 1;
      let generation = state.generation;
      state.invalidated_at.insert(key.to_string(), generation);
      state.in_flight.remove(key);
      state.prune();
    }

    if let Err(err) = self.cache.delete(key) {
      warn!(key, error = %err, "failed to invalidate cache entry");
    }
    debug!(key, "invalidated cache entry");
  }

  /// Drop every cache entry and detach all in-flight requests.
  pub fn clear_all(&self) -> usize {
    {
      let mut state = self.state();
      state.generation += 1;
      state.cleared_at = state.generation;
      state.invalidated_at.clear();
      state.in_flight.clear();
    }

    match self.cache.clear_all() {
      Ok(removed) => {
        info!(removed, "cleared stored data");
        removed
      }
      Err(err) => {
        warn!(error = %err, "failed to clear cache");
        0
      }
    }
  }

  /// Number of requests currently in flight.
  pub fn in_flight(&self) -> usize {
    self.state().in_flight.len()
  }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, FetchError> {
  serde_json::from_value(value).map_err(|e| FetchError::Decode {
    key: key.to_string(),
    message: e.to_string(),
  })
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      retry: self.retry,
      state: Arc::clone(&self.state),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{KeyValueStore, MemoryStore};
  use crate::cache::traits::{CacheSource, ManualClock};
  use crate::error::CacheError;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  const T0: i64 = 1_700_000_000_000;
  const LIST: Duration = Duration::from_secs(30);

  fn layer() -> (CacheLayer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::new(Arc::new(MemoryStore::new()), clock.clone());
    (CacheLayer::new(store), clock)
  }

  fn counting(
    calls: &Arc<AtomicUsize>,
    value: Vec<u32>,
  ) -> impl Fn() -> futures::future::Ready<Result<Vec<u32>, ApiError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Ok(value.clone()))
    }
  }

  fn failing(
    calls: &Arc<AtomicUsize>,
    make: fn() -> ApiError,
  ) -> impl Fn() -> futures::future::Ready<Result<Vec<u32>, ApiError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Err(make()))
    }
  }

  #[tokio::test]
  async fn test_second_call_within_expiry_hits_cache() {
    let (layer, clock) = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![1, 2]), false)
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    clock.advance(5_000);
    let second = layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![9]), false)
      .await
      .unwrap();

    assert_eq!(second.data, vec![1, 2]);
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_expired_entry_is_refetched() {
    let (layer, clock) = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![1]), false)
      .await
      .unwrap();
    clock.advance(30_001);
    let result = layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![2]), false)
      .await
      .unwrap();

    assert_eq!(result.data, vec![2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_force_refresh_bypasses_fresh_cache() {
    let (layer, _) = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![1]), false)
      .await
      .unwrap();
    let result = layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![2]), true)
      .await
      .unwrap();

    assert_eq!(result.data, vec![2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_concurrent_callers_share_one_request() {
    let (layer, _) = layer();
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let remote = {
      let calls = Arc::clone(&calls);
      let release = Arc::clone(&release);
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let release = Arc::clone(&release);
        async move {
          release.notified().await;
          Ok::<_, ApiError>(vec![7u32])
        }
      }
    };

    let a = layer.fetch_with_policy("pets_list", LIST, remote.clone(), false);
    let b = layer.fetch_with_policy("pets_list", LIST, remote, false);
    let releaser = async {
      tokio::task::yield_now().await;
      release.notify_one();
    };

    let (a, b, _) = tokio::join!(a, b, releaser);

    assert_eq!(a.unwrap().data, vec![7]);
    assert_eq!(b.unwrap().data, vec![7]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(layer.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_fallback_after_retries() {
    let (layer, clock) = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![1, 2, 3]), false)
      .await
      .unwrap();
    clock.advance(120_000);

    let failures = Arc::new(AtomicUsize::new(0));
    let result = layer
      .fetch_with_policy(
        "pets_list",
        LIST,
        failing(&failures, || ApiError::Connection("refused".into())),
        false,
      )
      .await
      .unwrap();

    assert_eq!(result.data, vec![1, 2, 3]);
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(failures.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_without_cache_propagates() {
    let (layer, _) = layer();
    let failures = Arc::new(AtomicUsize::new(0));

    let err = layer
      .fetch_with_policy(
        "owners_list",
        LIST,
        failing(&failures, || ApiError::Timeout("slow".into())),
        false,
      )
      .await
      .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(failures.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_not_found_invalidates_entry() {
    let (layer, clock) = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch_with_policy("pet_42", LIST, counting(&calls, vec![42]), false)
      .await
      .unwrap();
    clock.advance(60_000);

    let failures = Arc::new(AtomicUsize::new(0));
    let err = layer
      .fetch_with_policy(
        "pet_42",
        LIST,
        failing(&failures, || ApiError::NotFound("mascotas_id/42".into())),
        false,
      )
      .await
      .unwrap_err();

    assert!(err.api().is_some_and(ApiError::is_not_found));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(layer.store().peek::<Value>("pet_42").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_invalidation_discards_in_flight_response() {
    let (layer, _) = layer();
    let release = Arc::new(Notify::new());

    let slow = {
      let release = Arc::clone(&release);
      move || {
        let release = Arc::clone(&release);
        async move {
          release.notified().await;
          Ok::<_, ApiError>(vec![1u32])
        }
      }
    };

    let pending = layer.fetch_with_policy("pets_list", LIST, slow, false);
    let mutate = async {
      tokio::task::yield_now().await;
      layer.invalidate("pets_list");
      release.notify_one();
    };
    let (old, _) = tokio::join!(pending, mutate);
    assert_eq!(old.unwrap().data, vec![1]);

    // The pre-mutation response was not cached, so the next read refetches.
    assert!(layer.store().peek::<Value>("pets_list").unwrap().is_none());
    let calls = Arc::new(AtomicUsize::new(0));
    let fresh = layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![2]), false)
      .await
      .unwrap();
    assert_eq!(fresh.data, vec![2]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidation_marks_are_pruned() {
    let (layer, _) = layer();

    for id in 0..100 {
      layer.invalidate(&format!("pet_{}", id));
    }
    assert!(layer.state().invalidated_at.is_empty());

    let release = Arc::new(Notify::new());
    let slow = {
      let release = Arc::clone(&release);
      move || {
        let release = Arc::clone(&release);
        async move {
          release.notified().await;
          Ok::<_, ApiError>(vec![1u32])
        }
      }
    };

    let pending = layer.fetch_with_policy("pet_1", LIST, slow, false);
    let mutate = async {
      tokio::task::yield_now().await;
      layer.invalidate("pet_1");
      // The detached request still needs the mark to discard its response
      assert_eq!(layer.state().invalidated_at.len(), 1);
      release.notify_one();
    };
    let (result, _) = tokio::join!(pending, mutate);
    assert!(result.is_ok());

    assert!(layer.state().invalidated_at.is_empty());
    assert!(layer.store().peek::<Value>("pet_1").unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_error_falls_back_to_stale_cache() {
    let (layer, clock) = layer();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch_with_policy("owners_list", LIST, counting(&calls, vec![4]), false)
      .await
      .unwrap();
    clock.advance(60_000);

    let failures = Arc::new(AtomicUsize::new(0));
    let result = layer
      .fetch_with_policy(
        "owners_list",
        LIST,
        failing(&failures, || ApiError::Status {
          status: 500,
          body: String::new(),
        }),
        false,
      )
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(failures.load(Ordering::SeqCst), 3);
  }

  struct BrokenStore;

  impl KeyValueStore for BrokenStore {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
      Err(CacheError::Storage("disk full".into()))
    }
    fn set(&self, _key: &str, _value: &[u8]) -> Result<(), CacheError> {
      Err(CacheError::Storage("disk full".into()))
    }
    fn delete(&self, _key: &str) -> Result<(), CacheError> {
      Err(CacheError::Storage("disk full".into()))
    }
    fn keys(&self) -> Result<Vec<String>, CacheError> {
      Err(CacheError::Storage("disk full".into()))
    }
  }

  #[tokio::test]
  async fn test_storage_failures_never_reach_caller() {
    let clock = Arc::new(ManualClock::new(T0));
    let layer = CacheLayer::new(CacheStore::new(Arc::new(BrokenStore), clock));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch_with_policy("pets_list", LIST, counting(&calls, vec![5]), false)
      .await
      .unwrap();
    assert_eq!(result.data, vec![5]);

    layer.invalidate("pets_list");
    assert_eq!(layer.clear_all(), 0);
  }
}
