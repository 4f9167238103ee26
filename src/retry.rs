//! Retry with backoff for transient API failures.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
  /// Same delay before every retry
  Fixed,
  /// Delay doubles after each failed attempt
  #[default]
  Exponential,
}

/// Bounded retry policy. Delays never decrease from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub attempts: u32,
  /// Delay before the first retry
  pub base_delay: Duration,
  pub backoff: Backoff,
}

impl RetryPolicy {
  pub const fn new(attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
    Self {
      attempts,
      base_delay,
      backoff,
    }
  }

  /// Three attempts, waiting 1s then 2s.
  pub const fn reads() -> Self {
    Self::new(3, Duration::from_secs(1), Backoff::Exponential)
  }

  /// Three attempts with a fixed 2s pause, used for location submissions.
  pub const fn submissions() -> Self {
    Self::new(3, Duration::from_secs(2), Backoff::Fixed)
  }

  /// A single attempt.
  pub const fn none() -> Self {
    Self::new(1, Duration::ZERO, Backoff::Fixed)
  }

  /// Delay to wait after the `failed`-th failed attempt (1-based).
  pub fn delay_after(&self, failed: u32) -> Duration {
    match self.backoff {
      Backoff::Fixed => self.base_delay,
      Backoff::Exponential => {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
      }
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::reads()
  }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, ApiError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ApiError>>,
{
  let attempts = policy.attempts.max(1);
  let mut failed = 0;

  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(err) if err.is_transient() && failed + 1 < attempts => {
        failed += 1;
        let delay = policy.delay_after(failed);
        warn!(label, attempt = failed, ?delay, error = %err, "transient failure, retrying");
        tokio::time::sleep(delay).await;
      }
      Err(err) => return Err(err),
    }
  }
}
