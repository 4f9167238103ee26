//! Error types shared across the cache, API and location layers.

use std::sync::Arc;

use thiserror::Error;

/// Failures of the local key/value storage or of (de)serializing cached values.
///
/// The cache is an optimization only: callers log these and carry on as if
/// the entry were absent.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("storage error: {0}")]
  Storage(String),

  #[error("failed to serialize cached value for {key}: {source}")]
  Serialize {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to deserialize cached value for {key}: {source}")]
  Deserialize {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("corrupt timestamp for {key}: {value:?}")]
  Timestamp { key: String, value: String },

  #[error("storage lock poisoned")]
  LockPoisoned,
}

impl From<rusqlite::Error> for CacheError {
  fn from(err: rusqlite::Error) -> Self {
    CacheError::Storage(err.to_string())
  }
}

/// Errors from talking to the remote REST API.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("request timed out: {0}")]
  Timeout(String),

  #[error("connection failed: {0}")]
  Connection(String),

  #[error("resource not found: {0}")]
  NotFound(String),

  #[error("validation failed: {0}")]
  Validation(String),

  #[error("server returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("failed to decode response from {url}: {message}")]
  Decode { url: String, message: String },

  #[error("invalid url: {0}")]
  InvalidUrl(String),
}

impl ApiError {
  /// Whether retrying the same request later could succeed.
  ///
  /// Timeouts, connection failures, rate limiting and any 5xx response are
  /// transient; a 4xx means the server rejected the request on its merits.
  pub fn is_transient(&self) -> bool {
    match self {
      ApiError::Timeout(_) | ApiError::Connection(_) => true,
      ApiError::Status { status, .. } => *status == 429 || (500..=599).contains(status),
      _ => false,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, ApiError::NotFound(_))
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      ApiError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
      ApiError::Connection(err.to_string())
    } else if err.is_decode() {
      ApiError::Decode {
        url: err.url().map(|u| u.to_string()).unwrap_or_default(),
        message: err.to_string(),
      }
    } else {
      ApiError::Connection(err.to_string())
    }
  }
}

/// Error produced by the fetch layer.
///
/// Cloneable so that every caller waiting on a coalesced request receives
/// the same outcome.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
  #[error(transparent)]
  Api(Arc<ApiError>),

  #[error("failed to decode cached value for {key}: {message}")]
  Decode { key: String, message: String },

  #[error("in-flight request for {0} was aborted")]
  Aborted(String),
}

impl FetchError {
  pub fn api(&self) -> Option<&ApiError> {
    match self {
      FetchError::Api(err) => Some(err),
      _ => None,
    }
  }

  pub fn is_transient(&self) -> bool {
    self.api().is_some_and(ApiError::is_transient)
  }
}

impl From<ApiError> for FetchError {
  fn from(err: ApiError) -> Self {
    FetchError::Api(Arc::new(err))
  }
}

/// Errors from acquiring or reporting a device position.
#[derive(Debug, Error)]
pub enum LocationError {
  #[error("location permission denied")]
  PermissionDenied,

  #[error("position unavailable: {0}")]
  PositionUnavailable(String),

  #[error("invalid coordinate {0:?}")]
  InvalidCoordinate(String),

  #[error(transparent)]
  Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
  use super::*;

  fn status(status: u16) -> ApiError {
    ApiError::Status {
      status,
      body: String::new(),
    }
  }

  #[test]
  fn test_transient_classification() {
    assert!(ApiError::Timeout("slow".into()).is_transient());
    assert!(ApiError::Connection("refused".into()).is_transient());
    assert!(status(429).is_transient());
    assert!(status(500).is_transient());
    assert!(status(503).is_transient());
    assert!(status(599).is_transient());

    assert!(!status(403).is_transient());
    assert!(!status(409).is_transient());
    assert!(!ApiError::Validation("nombre is required".into()).is_transient());
    assert!(!ApiError::NotFound("mascotas_id/9".into()).is_transient());
    assert!(FetchError::from(status(500)).is_transient());
  }
}
