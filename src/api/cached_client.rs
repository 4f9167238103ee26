//! Pets API client with transparent caching.

use std::sync::Arc;
use std::time::Duration;

use super::client::ApiClient;
use super::endpoint::Endpoint;
use super::repository::{Expiry, Repository};
use super::types::{LocationSample, Owner, Pet};
use crate::cache::{CacheLayer, CacheResult, CacheStore, KeyValueStore, NoopStore, SystemClock};
use crate::config::Config;
use crate::error::{ApiError, FetchError};

/// Entry point for everything that talks to the backend.
///
/// Pet and owner reads are cached; location history is always live.
#[derive(Clone)]
pub struct CachedApiClient {
  inner: ApiClient,
  cache: CacheLayer,
  pets: Repository<Pet>,
  owners: Repository<Owner>,
}

impl CachedApiClient {
  /// Build a client whose base URL and cache both live in `store`.
  pub fn new(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
    let endpoint = Endpoint::persistent(&config.api.base_url, Arc::clone(&store))?;
    let inner = ApiClient::new(endpoint, Duration::from_secs(config.api.timeout_secs))?;

    let cache_backend: Arc<dyn KeyValueStore> = if config.cache.enabled {
      store
    } else {
      Arc::new(NoopStore)
    };
    let cache = CacheLayer::new(CacheStore::new(cache_backend, Arc::new(SystemClock)))
      .with_retry(config.cache.retry_policy());

    Ok(Self::with_parts(
      inner,
      cache,
      Expiry {
        list: Duration::from_secs(config.cache.pets_list_secs),
        detail: Duration::from_secs(config.cache.pet_detail_secs),
      },
      Expiry {
        list: Duration::from_secs(config.cache.owners_list_secs),
        detail: Duration::from_secs(config.cache.owner_detail_secs),
      },
    ))
  }

  pub fn with_parts(inner: ApiClient, cache: CacheLayer, pets: Expiry, owners: Expiry) -> Self {
    Self {
      pets: Repository::new(inner.clone(), cache.clone(), pets),
      owners: Repository::new(inner.clone(), cache.clone(), owners),
      inner,
      cache,
    }
  }

  pub fn pets(&self) -> &Repository<Pet> {
    &self.pets
  }

  pub fn owners(&self) -> &Repository<Owner> {
    &self.owners
  }

  /// The uncached client, e.g. for location submission.
  pub fn raw(&self) -> &ApiClient {
    &self.inner
  }

  pub fn endpoint(&self) -> &Endpoint {
    self.inner.endpoint()
  }

  /// Pets whose owner is `owner_id`, read through the cached pet list.
  pub async fn pets_of_owner(&self, owner_id: i64) -> Result<CacheResult<Vec<Pet>>, FetchError> {
    let pets = self.pets.list(false).await?;
    Ok(pets.map(|all| all.into_iter().filter(|p| p.owner_id == owner_id).collect()))
  }

  /// Whether any pet still references `owner_id`.
  ///
  /// Owners with pets must not be deleted. Both the cached pet list and the
  /// pet summaries nested in the cached owner are consulted.
  pub async fn owner_has_pets(&self, owner_id: i64) -> Result<bool, FetchError> {
    if !self.pets_of_owner(owner_id).await?.data.is_empty() {
      return Ok(true);
    }

    match self.owners.get_by_id(owner_id, false).await {
      Ok(owner) => Ok(!owner.data.mascotas.is_empty()),
      Err(err) if err.api().is_some_and(ApiError::is_not_found) => Ok(false),
      Err(err) => Err(err),
    }
  }

  /// Drop every cached response. Settings and queued locations are kept.
  pub fn clear_all_stored_data(&self) -> usize {
    self.cache.clear_all()
  }

  pub async fn list_locations(&self) -> Result<Vec<LocationSample>, ApiError> {
    self.inner.list_locations().await
  }

  pub async fn recent_locations(&self, pet_id: i64, minutes: u32) -> Result<Vec<LocationSample>, ApiError> {
    self.inner.recent_locations(pet_id, minutes).await
  }
}
