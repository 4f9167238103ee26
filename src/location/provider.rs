//! Contracts for the device position source and the submission endpoint.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::geo::Position;
use crate::api::{ApiClient, LocationReport};
use crate::error::{ApiError, LocationError};

/// Result of asking the user for location access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
  Granted,
  Denied,
}

/// Source of device positions (GPS receiver, platform geolocation, ...).
#[async_trait]
pub trait PositionProvider: Send + Sync {
  /// Ask for access. Called again whenever access was previously denied.
  async fn request_permission(&self) -> Permission;

  /// The current position, or why none is available.
  async fn current_position(&self) -> Result<Position, LocationError>;
}

/// Where location reports are sent.
#[async_trait]
pub trait LocationSink: Send + Sync {
  async fn submit(&self, report: &LocationReport) -> Result<(), ApiError>;
}

#[async_trait]
impl LocationSink for ApiClient {
  async fn submit(&self, report: &LocationReport) -> Result<(), ApiError> {
    self.submit_location(report).await
  }
}

/// A position entered by hand; access is always granted.
pub struct StaticPosition(pub Position);

#[async_trait]
impl PositionProvider for StaticPosition {
  async fn request_permission(&self) -> Permission {
    Permission::Granted
  }

  async fn current_position(&self) -> Result<Position, LocationError> {
    Ok(self.0.clone())
  }
}

/// Positions read from a text file kept up to date by an external GPS logger.
///
/// The last non-empty `lat,lon` line is the current position. Lines starting
/// with `#` are ignored.
pub struct FilePositionSource {
  path: PathBuf,
}

impl FilePositionSource {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

#[async_trait]
impl PositionProvider for FilePositionSource {
  async fn request_permission(&self) -> Permission {
    match tokio::fs::metadata(&self.path).await {
      Ok(meta) if meta.is_file() => Permission::Granted,
      _ => Permission::Denied,
    }
  }

  async fn current_position(&self) -> Result<Position, LocationError> {
    let contents = tokio::fs::read_to_string(&self.path)
      .await
      .map_err(|e| LocationError::PositionUnavailable(format!("{}: {}", self.path.display(), e)))?;

    let line = contents
      .lines()
      .map(str::trim)
      .filter(|l| !l.is_empty() && !l.starts_with('#'))
      .last()
      .ok_or_else(|| LocationError::PositionUnavailable(format!("{} has no fixes yet", self.path.display())))?;

    let (lat, lon) = line
      .split_once(',')
      .ok_or_else(|| LocationError::InvalidCoordinate(line.to_string()))?;

    let position = Position::parse(lat, lon)?;
    debug!(path = %self.path.display(), %position, "read position");
    Ok(position)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_reads_last_fix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixes.txt");
    std::fs::write(&path, "# lat,lon\n1.2136,-77.2811\n1.211903872, -77.2821\n\n").unwrap();

    let source = FilePositionSource::new(&path);
    assert_eq!(source.request_permission().await, Permission::Granted);

    let position = source.current_position().await.unwrap();
    assert_eq!(position.latitude.as_str(), "1.211903872");
    assert_eq!(position.longitude.as_str(), "-77.2821");
  }

  #[tokio::test]
  async fn test_missing_file_is_denied_and_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let source = FilePositionSource::new(dir.path().join("absent.txt"));

    assert_eq!(source.request_permission().await, Permission::Denied);
    assert!(matches!(
      source.current_position().await,
      Err(LocationError::PositionUnavailable(_))
    ));
  }

  #[tokio::test]
  async fn test_malformed_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixes.txt");
    std::fs::write(&path, "1.2136;-77.2811\n").unwrap();

    let err = FilePositionSource::new(&path).current_position().await.unwrap_err();
    assert!(matches!(err, LocationError::InvalidCoordinate(_)));
  }
}
