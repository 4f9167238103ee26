//! Typed CRUD access to pets and owners on top of the cache layer.

use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, info};

use super::client::ApiClient;
use super::types::{MaybeWrapped, Owner, OwnerDraft, Pet, PetDraft};
use crate::cache::{CacheLayer, CacheResult};
use crate::error::{ApiError, FetchError};

/// An entity the backend exposes with list/get/create/update/delete endpoints.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Create/update payload
  type Draft: Serialize + Send + Sync;

  /// Human-readable name for logs (e.g. "pet")
  const NAME: &'static str;

  /// Cache key of the full list (e.g. "pets_list")
  const LIST_KEY: &'static str;

  fn detail_key(id: i64) -> String;

  fn list_path() -> String;
  fn detail_path(id: i64) -> String;
  fn create_path() -> String;
  fn update_path(id: i64) -> String;
  fn delete_path(id: i64) -> String;

  fn validate(draft: &Self::Draft) -> Result<(), ApiError>;
}

// ============================================================================
// Resource implementations
// ============================================================================

impl Resource for Pet {
  type Draft = PetDraft;

  const NAME: &'static str = "pet";
  const LIST_KEY: &'static str = "pets_list";

  fn detail_key(id: i64) -> String {
    format!("pet_{}", id)
  }

  fn list_path() -> String {
    "mascotas/mascotas_list".to_string()
  }

  fn detail_path(id: i64) -> String {
    format!("mascotas/mascotas_id/{}", id)
  }

  fn create_path() -> String {
    "mascotas/mascotas_create".to_string()
  }

  fn update_path(id: i64) -> String {
    format!("mascotas/mascotas_update/{}", id)
  }

  fn delete_path(id: i64) -> String {
    format!("mascotas/mascotas_delete/{}", id)
  }

  fn validate(draft: &PetDraft) -> Result<(), ApiError> {
    draft.validate()
  }
}

impl Resource for Owner {
  type Draft = OwnerDraft;

  const NAME: &'static str = "owner";
  const LIST_KEY: &'static str = "owners_list";

  fn detail_key(id: i64) -> String {
    format!("owner_{}", id)
  }

  fn list_path() -> String {
    "dueño/dueños_list".to_string()
  }

  fn detail_path(id: i64) -> String {
    format!("dueño/dueños_id/{}", id)
  }

  fn create_path() -> String {
    "dueño/dueños_create".to_string()
  }

  fn update_path(id: i64) -> String {
    format!("dueño/dueños_update/{}", id)
  }

  fn delete_path(id: i64) -> String {
    format!("dueño/dueños_delete/{}", id)
  }

  fn validate(draft: &OwnerDraft) -> Result<(), ApiError> {
    draft.validate()
  }
}

// ============================================================================
// Repository
// ============================================================================

/// Expiry windows for one resource.
#[derive(Debug, Clone, Copy)]
pub struct Expiry {
  pub list: Duration,
  pub detail: Duration,
}

/// Cached reads and cache-invalidating writes for one resource type.
///
/// Reads go through the cache layer. Writes go straight to the network, are
/// never retried, and on success drop the list entry (and the detail entry
/// for updates and deletes) so the next read sees the change.
pub struct Repository<R: Resource> {
  client: ApiClient,
  cache: CacheLayer,
  expiry: Expiry,
  _resource: PhantomData<fn() -> R>,
}

impl<R: Resource> Clone for Repository<R> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      cache: self.cache.clone(),
      expiry: self.expiry,
      _resource: PhantomData,
    }
  }
}

impl<R: Resource> Repository<R> {
  pub fn new(client: ApiClient, cache: CacheLayer, expiry: Expiry) -> Self {
    Self {
      client,
      cache,
      expiry,
      _resource: PhantomData,
    }
  }

  /// All entities, cached for the list expiry window.
  pub async fn list(&self, force_refresh: bool) -> Result<CacheResult<Vec<R>>, FetchError> {
    let client = self.client.clone();
    self
      .cache
      .fetch_with_policy(
        R::LIST_KEY,
        self.expiry.list,
        move || {
          let client = client.clone();
          async move { client.get::<Vec<R>>(&R::list_path()).await }
        },
        force_refresh,
      )
      .await
  }

  /// One entity by id, cached for the detail expiry window.
  pub async fn get_by_id(&self, id: i64, force_refresh: bool) -> Result<CacheResult<R>, FetchError> {
    let client = self.client.clone();
    self
      .cache
      .fetch_with_policy(
        &R::detail_key(id),
        self.expiry.detail,
        move || {
          let client = client.clone();
          async move { client.get::<R>(&R::detail_path(id)).await }
        },
        force_refresh,
      )
      .await
  }

  pub async fn create(&self, draft: &R::Draft) -> Result<R, ApiError> {
    R::validate(draft)?;

    let created: MaybeWrapped<R> = self.client.post(&R::create_path(), draft).await?;
    self.cache.invalidate(R::LIST_KEY);

    info!(resource = R::NAME, "created");
    Ok(created.into_inner())
  }

  pub async fn update(&self, id: i64, draft: &R::Draft) -> Result<R, ApiError> {
    R::validate(draft)?;

    let result = self
      .client
      .put::<_, MaybeWrapped<R>>(&R::update_path(id), draft)
      .await;
    self.after_write(id, &result);

    let updated = result?;
    info!(resource = R::NAME, id, "updated");
    Ok(updated.into_inner())
  }

  pub async fn delete(&self, id: i64) -> Result<(), ApiError> {
    let result = self.client.delete(&R::delete_path(id)).await;
    self.after_write(id, &result);

    result?;
    info!(resource = R::NAME, id, "deleted");
    Ok(())
  }

  /// Drop cached copies after a write that succeeded, or that found the
  /// entity already gone on the server.
  fn after_write<T>(&self, id: i64, result: &Result<T, ApiError>) {
    let touched = match result {
      Ok(_) => true,
      Err(err) => err.is_not_found(),
    };

    if touched {
      debug!(resource = R::NAME, id, "invalidating cached copies");
      self.cache.invalidate(R::LIST_KEY);
      self.cache.invalidate(&R::detail_key(id));
    }
  }
}
