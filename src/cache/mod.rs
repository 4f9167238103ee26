//! Local caching for remote API reads.
//!
//! This module provides:
//! - A key/value storage contract with SQLite, in-memory and no-op backends
//! - A timestamped cache store with expiry-aware reads
//! - A fetch layer: cache-first reads, one request per key at a time,
//!   retry with backoff and stale fallback when the network is unavailable

mod layer;
mod storage;
mod store;
mod traits;

pub use layer::CacheLayer;
pub use storage::{KeyValueStore, MemoryStore, NoopStore, SqliteStore};
pub use store::{CacheEntry, CacheStore, CACHE_PREFIX, TIMESTAMP_PREFIX};
pub use traits::{CacheResult, CacheSource, Clock, ManualClock, SystemClock};
