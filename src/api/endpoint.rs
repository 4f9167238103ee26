//! Runtime-configurable base URL of the backend.

use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::cache::KeyValueStore;
use crate::error::ApiError;

/// Storage key under which a base URL set at runtime is persisted.
pub const BASE_URL_KEY: &str = "settings_api_base_url";

/// Where API requests go.
///
/// Shared by every clone, so a `set_base_url` is seen by all clients built
/// from the same endpoint. When backed by a store the value survives restarts.
#[derive(Clone)]
pub struct Endpoint {
  base: Arc<RwLock<Url>>,
  store: Option<Arc<dyn KeyValueStore>>,
}

impl Endpoint {
  /// An endpoint that only lives in memory.
  pub fn new(base_url: &str) -> Result<Self, ApiError> {
    Ok(Self {
      base: Arc::new(RwLock::new(normalize(base_url)?)),
      store: None,
    })
  }

  /// An endpoint persisted in `store`.
  ///
  /// A previously saved URL takes precedence over `default_url`.
  pub fn persistent(default_url: &str, store: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
    let saved = match store.get(BASE_URL_KEY) {
      Ok(Some(bytes)) => {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        match normalize(&text) {
          Ok(url) => Some(url),
          Err(err) => {
            warn!(error = %err, "ignoring invalid saved base url");
            None
          }
        }
      }
      Ok(None) => None,
      Err(err) => {
        warn!(error = %err, "failed to read saved base url");
        None
      }
    };

    let base = match saved {
      Some(url) => url,
      None => normalize(default_url)?,
    };

    Ok(Self {
      base: Arc::new(RwLock::new(base)),
      store: Some(store),
    })
  }

  /// The current base URL.
  pub fn base_url(&self) -> Url {
    self
      .base
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  /// Point every client sharing this endpoint at `url`.
  ///
  /// Failing to persist the value is logged; the in-memory change still applies.
  pub fn set_base_url(&self, url: &str) -> Result<Url, ApiError> {
    let url = normalize(url)?;

    *self
      .base
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = url.clone();

    if let Some(store) = &self.store {
      if let Err(err) = store.set(BASE_URL_KEY, url.as_str().as_bytes()) {
        warn!(error = %err, "failed to persist base url");
      }
    }

    info!(url = %url, "api base url changed");
    Ok(url)
  }

  /// Resolve `path` (relative, e.g. `"mascotas/mascotas_list"`) against the base URL.
  pub fn join(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base_url()
      .join(path.trim_start_matches('/'))
      .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", path, e)))
  }
}

/// Parse `raw` and make sure its path ends with `/` so relative joins append.
fn normalize(raw: &str) -> Result<Url, ApiError> {
  let mut url = Url::parse(raw.trim()).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", raw, e)))?;

  if !matches!(url.scheme(), "http" | "https") {
    return Err(ApiError::InvalidUrl(format!(
      "{}: unsupported scheme {}",
      raw,
      url.scheme()
    )));
  }

  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }

  Ok(url)
}
