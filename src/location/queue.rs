//! Bounded, persisted queue of location samples awaiting submission.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::geo::Position;
use super::provider::LocationSink;
use crate::api::{DecimalString, LocationReport};
use crate::cache::KeyValueStore;
use crate::error::CacheError;

/// Storage key of the queue.
pub const PENDING_KEY: &str = "pending_locations";

/// Default maximum queue length.
pub const DEFAULT_CAPACITY: usize = 50;

/// A sample whose submission failed, kept for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLocationSample {
  pub pet_id: i64,
  pub latitude: DecimalString,
  pub longitude: DecimalString,
  pub captured_at_millis: i64,
}

impl PendingLocationSample {
  pub fn new(pet_id: i64, position: &Position, captured_at_millis: i64) -> Self {
    Self {
      pet_id,
      latitude: position.latitude.clone(),
      longitude: position.longitude.clone(),
      captured_at_millis,
    }
  }

  pub fn report(&self) -> LocationReport {
    LocationReport {
      mascota: self.pet_id,
      latitud: self.latitude.clone(),
      longitud: self.longitude.clone(),
    }
  }
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  pub sent: usize,
  /// Dropped because the server rejected them outright
  pub rejected: usize,
  /// Still queued after the pass
  pub remaining: usize,
}

/// FIFO of pending samples, stored as JSON in the key/value store.
///
/// Every mutation is a read-modify-write done under one lock, so concurrent
/// ticks never lose each other's updates. That lock is never held across I/O
/// to the sink; replay passes are serialized by a separate async lock so a
/// sample is never submitted by two passes at once.
#[derive(Clone)]
pub struct PendingQueue {
  store: Arc<dyn KeyValueStore>,
  capacity: usize,
  lock: Arc<Mutex<()>>,
  replay: Arc<tokio::sync::Mutex<()>>,
}

impl PendingQueue {
  pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
    Self {
      store,
      capacity: capacity.max(1),
      lock: Arc::new(Mutex::new(())),
      replay: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  fn guard(&self) -> MutexGuard<'_, ()> {
    self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn load(&self) -> Result<Vec<PendingLocationSample>, CacheError> {
    match self.store.get(PENDING_KEY)? {
      Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| CacheError::Deserialize {
        key: PENDING_KEY.to_string(),
        source,
      }),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, samples: &[PendingLocationSample]) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec(samples).map_err(|source| CacheError::Serialize {
      key: PENDING_KEY.to_string(),
      source,
    })?;
    self.store.set(PENDING_KEY, &bytes)
  }

  /// Append `sample`, dropping the oldest entries beyond capacity.
  ///
  /// Returns how many entries were dropped.
  pub fn enqueue(&self, sample: PendingLocationSample) -> Result<usize, CacheError> {
    let _guard = self.guard();

    let mut samples = self.load().unwrap_or_else(|err| {
      warn!(error = %err, "pending queue unreadable, starting over");
      Vec::new()
    });
    samples.push(sample);

    let overflow = samples.len().saturating_sub(self.capacity);
    if overflow > 0 {
      samples.drain(..overflow);
      warn!(dropped = overflow, capacity = self.capacity, "pending queue full, dropped oldest samples");
    }

    self.save(&samples)?;
    debug!(len = samples.len(), "queued location sample");
    Ok(overflow)
  }

  /// Queued samples, oldest first.
  pub fn snapshot(&self) -> Result<Vec<PendingLocationSample>, CacheError> {
    let _guard = self.guard();
    self.load()
  }

  pub fn len(&self) -> usize {
    self.snapshot().map(|s| s.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove the first queued sample equal to `sample`.
  fn remove(&self, sample: &PendingLocationSample) -> Result<(), CacheError> {
    let _guard = self.guard();
    let mut samples = self.load()?;
    if let Some(index) = samples.iter().position(|s| s == sample) {
      samples.remove(index);
      self.save(&samples)?;
    }
    Ok(())
  }

  /// Resend every queued sample in order.
  ///
  /// Each success is removed from the queue; transient failures stay queued
  /// for the next pass. A pass started while another is running waits for it
  /// and then only sees what is still queued.
  pub async fn send_pending(&self, sink: &dyn LocationSink) -> Result<ReplayReport, CacheError> {
    let _pass = self.replay.lock().await;
    let samples = self.snapshot()?;
    let mut report = ReplayReport::default();

    for sample in &samples {
      match sink.submit(&sample.report()).await {
        Ok(()) => {
          self.remove(sample)?;
          report.sent += 1;
        }
        Err(err) if err.is_transient() => {
          debug!(pet_id = sample.pet_id, error = %err, "replay failed, keeping sample");
        }
        Err(err) => {
          warn!(pet_id = sample.pet_id, error = %err, "server rejected queued sample, dropping it");
          self.remove(sample)?;
          report.rejected += 1;
        }
      }
    }

    report.remaining = self.len();
    if report.sent > 0 || report.rejected > 0 {
      info!(sent = report.sent, rejected = report.rejected, remaining = report.remaining, "replayed pending locations");
    }
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::error::ApiError;
  use async_trait::async_trait;
  use std::time::Duration;

  fn sample(pet_id: i64, millis: i64) -> PendingLocationSample {
    PendingLocationSample {
      pet_id,
      latitude: DecimalString::parse("1.211903872").unwrap(),
      longitude: DecimalString::parse("-77.0").unwrap(),
      captured_at_millis: millis,
    }
  }

  struct ScriptedSink {
    reject_pet: Option<i64>,
    offline_pet: Option<i64>,
    failing_pet: Option<i64>,
    delay: Duration,
    sent: Mutex<Vec<LocationReport>>,
  }

  impl ScriptedSink {
    fn new() -> Self {
      Self {
        reject_pet: None,
        offline_pet: None,
        failing_pet: None,
        delay: Duration::ZERO,
        sent: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait]
  impl LocationSink for ScriptedSink {
    async fn submit(&self, report: &LocationReport) -> Result<(), ApiError> {
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      if self.failing_pet == Some(report.mascota) {
        return Err(ApiError::Status {
          status: 500,
          body: "Internal Server Error".into(),
        });
      }
      if self.offline_pet == Some(report.mascota) {
        return Err(ApiError::Connection("refused".into()));
      }
      if self.reject_pet == Some(report.mascota) {
        return Err(ApiError::Validation("mascota does not exist".into()));
      }
      self.sent.lock().unwrap().push(report.clone());
      Ok(())
    }
  }

  #[test]
  fn test_capacity_drops_oldest() {
    let queue = PendingQueue::new(Arc::new(MemoryStore::new()), DEFAULT_CAPACITY);

    for i in 0..DEFAULT_CAPACITY as i64 {
      assert_eq!(queue.enqueue(sample(7, i)).unwrap(), 0);
    }
    assert_eq!(queue.enqueue(sample(7, 50)).unwrap(), 1);

    let samples = queue.snapshot().unwrap();
    assert_eq!(samples.len(), DEFAULT_CAPACITY);
    assert_eq!(samples[0].captured_at_millis, 1);
    assert_eq!(samples[49].captured_at_millis, 50);
  }

  #[test]
  fn test_persisted_across_instances() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    PendingQueue::new(Arc::clone(&store), 10).enqueue(sample(7, 1)).unwrap();

    let reopened = PendingQueue::new(store, 10);
    let samples = reopened.snapshot().unwrap();
    assert_eq!(samples, vec![sample(7, 1)]);
    // Digits survive storage untouched
    assert_eq!(samples[0].latitude.as_str(), "1.211903872");
  }

  #[tokio::test]
  async fn test_replay_keeps_transient_failures() {
    let queue = PendingQueue::new(Arc::new(MemoryStore::new()), 10);
    queue.enqueue(sample(7, 1)).unwrap();
    queue.enqueue(sample(8, 2)).unwrap();
    queue.enqueue(sample(9, 3)).unwrap();

    let sink = ScriptedSink {
      offline_pet: Some(8),
      reject_pet: Some(9),
      ..ScriptedSink::new()
    };
    let report = queue.send_pending(&sink).await.unwrap();

    assert_eq!(
      report,
      ReplayReport {
        sent: 1,
        rejected: 1,
        remaining: 1
      }
    );
    assert_eq!(queue.snapshot().unwrap(), vec![sample(8, 2)]);
    assert_eq!(sink.sent.lock().unwrap()[0].mascota, 7);
  }

  #[tokio::test]
  async fn test_replay_of_empty_queue() {
    let queue = PendingQueue::new(Arc::new(MemoryStore::new()), 10);
    let report = queue.send_pending(&ScriptedSink::new()).await.unwrap();
    assert_eq!(report, ReplayReport::default());
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_server_error_keeps_sample_queued() {
    let queue = PendingQueue::new(Arc::new(MemoryStore::new()), 10);
    queue.enqueue(sample(7, 1)).unwrap();

    let sink = ScriptedSink {
      failing_pet: Some(7),
      ..ScriptedSink::new()
    };
    let report = queue.send_pending(&sink).await.unwrap();

    assert_eq!(
      report,
      ReplayReport {
        sent: 0,
        rejected: 0,
        remaining: 1
      }
    );
    assert_eq!(queue.snapshot().unwrap(), vec![sample(7, 1)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_replays_send_each_sample_once() {
    let queue = PendingQueue::new(Arc::new(MemoryStore::new()), 10);
    queue.enqueue(sample(7, 1)).unwrap();
    queue.enqueue(sample(8, 2)).unwrap();

    let sink = ScriptedSink {
      delay: Duration::from_millis(100),
      ..ScriptedSink::new()
    };
    let other = queue.clone();
    let (a, b) = tokio::join!(queue.send_pending(&sink), other.send_pending(&sink));

    assert_eq!(a.unwrap().sent + b.unwrap().sent, 2);
    assert_eq!(sink.sent.lock().unwrap().len(), 2);
    assert!(queue.is_empty());
  }
}
