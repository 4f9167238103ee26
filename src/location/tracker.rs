//! Periodic location reporting for one pet.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::geo::{classify, Displacement, Position};
use super::provider::{LocationSink, Permission, PositionProvider};
use super::queue::{PendingLocationSample, PendingQueue, ReplayReport};
use crate::api::LocationReport;
use crate::cache::{Clock, SystemClock};
use crate::config::TrackingConfig;
use crate::error::{ApiError, CacheError, LocationError};
use crate::retry::{retry_transient, RetryPolicy};

/// Number of reported samples kept in memory for display.
const HISTORY_LIMIT: usize = 100;

/// Tuning knobs of the reporting loop.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
  pub interval: Duration,
  pub min_displacement_m: f64,
  pub submit: RetryPolicy,
}

impl Default for TrackerSettings {
  fn default() -> Self {
    Self::from(&TrackingConfig::default())
  }
}

impl From<&TrackingConfig> for TrackerSettings {
  fn from(config: &TrackingConfig) -> Self {
    Self {
      interval: config.interval(),
      min_displacement_m: config.min_displacement_meters,
      submit: config.submit_policy(),
    }
  }
}

/// What one tick of the loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
  /// Submitted and accepted
  Reported {
    position: Position,
    distance_m: Option<f64>,
  },
  /// Too close to the last reported position; nothing sent
  Skipped { distance_m: f64 },
  /// Submission kept failing; the sample waits in the pending queue
  Queued,
  /// The server refused the sample; it was dropped
  Rejected(String),
  PositionUnavailable(String),
  PermissionDenied,
}

/// A sample the server accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedSample {
  pub position: Position,
  pub sent_at: DateTime<Utc>,
}

/// Snapshot of a tracker for display.
#[derive(Debug, Clone, Default)]
pub struct TrackerStatus {
  pub pet_id: i64,
  pub running: bool,
  pub last_reported: Option<Position>,
  pub last_sent_at: Option<DateTime<Utc>>,
  /// Persistent problem worth showing, e.g. denied permission
  pub message: Option<String>,
  pub history: Vec<ReportedSample>,
  pub pending: usize,
}

#[derive(Default)]
struct TrackerState {
  permission: Option<Permission>,
  last_reported: Option<Position>,
  last_sent_at: Option<DateTime<Utc>>,
  message: Option<String>,
  history: Vec<ReportedSample>,
  /// Whether the previous submission went through; replay is only tried then
  reachable: bool,
}

struct TrackerInner {
  pet_id: i64,
  provider: Arc<dyn PositionProvider>,
  sink: Arc<dyn LocationSink>,
  queue: PendingQueue,
  settings: TrackerSettings,
  clock: Arc<dyn Clock>,
  state: Mutex<TrackerState>,
  /// Serializes ticks and manual sends
  busy: tokio::sync::Mutex<()>,
}

struct Running {
  handle: JoinHandle<()>,
  cancel: oneshot::Sender<()>,
}

/// Samples the device position on a timer and reports it for one pet.
///
/// Positions closer than the displacement threshold to the last reported one
/// are skipped. Submissions are retried; a sample that still cannot be sent
/// goes to the pending queue instead of surfacing an error.
pub struct LocationTracker {
  inner: Arc<TrackerInner>,
  running: Mutex<Option<Running>>,
}

impl LocationTracker {
  pub fn new(
    pet_id: i64,
    provider: Arc<dyn PositionProvider>,
    sink: Arc<dyn LocationSink>,
    queue: PendingQueue,
    settings: TrackerSettings,
  ) -> Self {
    Self::with_clock(pet_id, provider, sink, queue, settings, Arc::new(SystemClock))
  }

  pub fn with_clock(
    pet_id: i64,
    provider: Arc<dyn PositionProvider>,
    sink: Arc<dyn LocationSink>,
    queue: PendingQueue,
    settings: TrackerSettings,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      inner: Arc::new(TrackerInner {
        pet_id,
        provider,
        sink,
        queue,
        settings,
        clock,
        state: Mutex::new(TrackerState {
          reachable: true,
          ..TrackerState::default()
        }),
        busy: tokio::sync::Mutex::new(()),
      }),
      running: Mutex::new(None),
    }
  }

  fn running(&self) -> MutexGuard<'_, Option<Running>> {
    self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn is_running(&self) -> bool {
    self.running().as_ref().is_some_and(|r| !r.handle.is_finished())
  }

  /// Start the timer. The first sample is taken immediately.
  ///
  /// Returns `false` if the tracker was already running; the existing timer
  /// is kept.
  pub fn start(&self) -> bool {
    let mut running = self.running();
    if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
      debug!(pet_id = self.inner.pet_id, "tracking already active");
      return false;
    }

    let (cancel, mut cancelled) = oneshot::channel();
    let inner = Arc::clone(&self.inner);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(inner.settings.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          biased;
          _ = &mut cancelled => break,
          _ = ticker.tick() => {
            let outcome = inner.tick().await;
            debug!(pet_id = inner.pet_id, ?outcome, "tick finished");
          }
        }
      }
      debug!(pet_id = inner.pet_id, "tracking loop exited");
    });

    *running = Some(Running { handle, cancel });
    info!(
      pet_id = self.inner.pet_id,
      interval = ?self.inner.settings.interval,
      "tracking started"
    );
    true
  }

  /// Stop the timer. A tick already in progress is allowed to finish.
  ///
  /// Returns `false` if the tracker was not running.
  pub fn stop(&self) -> bool {
    match self.running().take() {
      Some(running) => {
        // The loop may have exited already; nothing to cancel then
        let _ = running.cancel.send(());
        info!(pet_id = self.inner.pet_id, "tracking stopped");
        true
      }
      None => false,
    }
  }

  /// Run one sampling cycle now, as the timer would.
  pub async fn tick(&self) -> TickOutcome {
    self.inner.tick().await
  }

  /// Acquire the position and submit it, ignoring the displacement filter.
  ///
  /// Unlike the timer, failures are returned to the caller and nothing is queued.
  pub async fn send_now(&self) -> Result<Position, LocationError> {
    self.inner.send_now().await
  }

  /// Resend every queued sample. Waits for a tick in progress to finish.
  pub async fn send_pending(&self) -> Result<ReplayReport, CacheError> {
    let _busy = self.inner.busy.lock().await;
    self.inner.queue.send_pending(self.inner.sink.as_ref()).await
  }

  pub fn status(&self) -> TrackerStatus {
    let running = self.is_running();
    let pending = self.inner.queue.len();
    let state = self.inner.state();

    TrackerStatus {
      pet_id: self.inner.pet_id,
      running,
      last_reported: state.last_reported.clone(),
      last_sent_at: state.last_sent_at,
      message: state.message.clone(),
      history: state.history.clone(),
      pending,
    }
  }
}

impl Drop for LocationTracker {
  fn drop(&mut self) {
    self.stop();
  }
}

impl TrackerInner {
  fn state(&self) -> MutexGuard<'_, TrackerState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn now(&self) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(self.clock.now_millis()).unwrap_or_else(Utc::now)
  }

  /// Make sure location access is granted, asking again if it was not.
  async fn ensure_permission(&self) -> Result<(), LocationError> {
    let granted = self.state().permission == Some(Permission::Granted);
    if granted {
      return Ok(());
    }

    let permission = self.provider.request_permission().await;
    let mut state = self.state();
    state.permission = Some(permission);
    match permission {
      Permission::Granted => {
        state.message = None;
        Ok(())
      }
      Permission::Denied => {
        state.message = Some("Location permission denied".to_string());
        Err(LocationError::PermissionDenied)
      }
    }
  }

  async fn acquire(&self) -> Result<Position, LocationError> {
    self.ensure_permission().await?;

    match self.provider.current_position().await {
      Ok(position) => Ok(position),
      Err(LocationError::PermissionDenied) => {
        let mut state = self.state();
        state.permission = Some(Permission::Denied);
        state.message = Some("Location permission denied".to_string());
        Err(LocationError::PermissionDenied)
      }
      Err(err) => {
        self.state().message = Some(format!("Could not get location: {}", err));
        Err(err)
      }
    }
  }

  async fn submit(&self, position: &Position) -> Result<(), ApiError> {
    let report = LocationReport {
      mascota: self.pet_id,
      latitud: position.latitude.clone(),
      longitud: position.longitude.clone(),
    };
    let label = format!("location for pet {}", self.pet_id);
    retry_transient(&self.settings.submit, &label, || self.sink.submit(&report)).await
  }

  fn record_success(&self, position: &Position) {
    let sent_at = self.now();
    let mut state = self.state();
    state.last_reported = Some(position.clone());
    state.last_sent_at = Some(sent_at);
    state.reachable = true;
    state.message = None;
    state.history.push(ReportedSample {
      position: position.clone(),
      sent_at,
    });
    if state.history.len() > HISTORY_LIMIT {
      let excess = state.history.len() - HISTORY_LIMIT;
      state.history.drain(..excess);
    }
  }

  async fn tick(&self) -> TickOutcome {
    let _busy = self.busy.lock().await;

    let position = match self.acquire().await {
      Ok(position) => position,
      Err(LocationError::PermissionDenied) => {
        warn!(pet_id = self.pet_id, "location permission denied, skipping tick");
        return TickOutcome::PermissionDenied;
      }
      Err(err) => {
        warn!(pet_id = self.pet_id, error = %err, "position unavailable");
        return TickOutcome::PositionUnavailable(err.to_string());
      }
    };

    let last = self.state().last_reported.clone();
    let distance_m = match classify(last.as_ref(), &position, self.settings.min_displacement_m) {
      Displacement::Skipped { distance_m } => {
        debug!(pet_id = self.pet_id, distance_m, "not moved enough, skipping report");
        return TickOutcome::Skipped { distance_m };
      }
      Displacement::Reportable { distance_m } => distance_m,
    };

    let reachable = self.state().reachable;
    if reachable && !self.queue.is_empty() {
      if let Err(err) = self.queue.send_pending(self.sink.as_ref()).await {
        warn!(error = %err, "failed to replay pending locations");
      }
    }

    match self.submit(&position).await {
      Ok(()) => {
        self.record_success(&position);
        info!(pet_id = self.pet_id, %position, ?distance_m, "location reported");
        TickOutcome::Reported { position, distance_m }
      }
      Err(err) if err.is_transient() => {
        self.state().reachable = false;
        let sample = PendingLocationSample::new(self.pet_id, &position, self.clock.now_millis());
        if let Err(store_err) = self.queue.enqueue(sample) {
          warn!(error = %store_err, "failed to queue location sample");
        }
        warn!(pet_id = self.pet_id, error = %err, "location submission failed, queued for later");
        TickOutcome::Queued
      }
      Err(err) => {
        warn!(pet_id = self.pet_id, error = %err, "location rejected by server, dropping sample");
        TickOutcome::Rejected(err.to_string())
      }
    }
  }

  async fn send_now(&self) -> Result<Position, LocationError> {
    let _busy = self.busy.lock().await;

    let position = self.acquire().await?;
    self.submit(&position).await?;
    self.record_success(&position);
    info!(pet_id = self.pet_id, %position, "location sent");
    Ok(position)
  }
}
