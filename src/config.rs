use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};

/// Placeholder base URL; every deployment is expected to override it.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/";

/// Environment variable overriding `api.base_url`.
pub const API_URL_ENV: &str = "PETRACK_API_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Config file not found: {0}")]
  NotFound(PathBuf),

  #[error("Failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub tracking: TrackingConfig,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL of the REST backend, e.g. "https://pets.example.com/"
  pub base_url: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to always go to the network
  pub enabled: bool,
  pub pets_list_secs: u64,
  pub pet_detail_secs: u64,
  pub owners_list_secs: u64,
  pub owner_detail_secs: u64,
  /// Total attempts for a read, including the first
  pub retry_attempts: u32,
  /// Delay before the first retry; doubles afterwards
  pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      pets_list_secs: 30,
      pet_detail_secs: 60,
      owners_list_secs: 30,
      owner_detail_secs: 60,
      retry_attempts: 3,
      retry_delay_ms: 1000,
    }
  }
}

impl CacheConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.retry_attempts,
      Duration::from_millis(self.retry_delay_ms),
      Backoff::Exponential,
    )
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
  /// Seconds between position samples
  pub interval_secs: u64,
  /// Samples closer than this to the last reported position are skipped
  pub min_displacement_meters: f64,
  /// Total submission attempts before a sample is queued
  pub submit_attempts: u32,
  /// Fixed pause between submission attempts
  pub submit_delay_ms: u64,
  /// Maximum number of queued samples; the oldest are dropped first
  pub pending_capacity: usize,
}

impl Default for TrackingConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60,
      min_displacement_meters: 10.0,
      submit_attempts: 3,
      submit_delay_ms: 2000,
      pending_capacity: 50,
    }
  }
}

impl TrackingConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn submit_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.submit_attempts,
      Duration::from_millis(self.submit_delay_ms),
      Backoff::Fixed,
    )
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/petrack/store.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./petrack.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/petrack/config.yaml
  ///
  /// Without any file the defaults are used. `PETRACK_API_URL` overrides the base URL.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
    let path = match explicit_path {
      Some(p) if p.exists() => Some(p.to_path_buf()),
      Some(p) => return Err(ConfigError::NotFound(p.to_path_buf())),
      None => Self::find_config_file(),
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var(API_URL_ENV) {
      config.api.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("petrack.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("petrack").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }
}

/// Directory for the database and log files.
pub fn data_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("petrack"))
}
