//! Client for the pets REST backend.

mod cached_client;
mod client;
mod endpoint;
mod repository;
mod types;

pub use cached_client::CachedApiClient;
pub use client::ApiClient;
pub use endpoint::{Endpoint, BASE_URL_KEY};
pub use repository::{Expiry, Repository, Resource};
pub use types::{
  DecimalString, LastFix, LocationReport, LocationSample, MaybeWrapped, Owner, OwnerDraft, Pet, PetDraft,
  PetSummary,
};
