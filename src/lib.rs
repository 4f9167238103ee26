//! Client-side plumbing for a pet tracking service.
//!
//! Cached, retrying access to the pets and owners REST API, and a background
//! loop that reports a pet's GPS position with offline queueing.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod location;
pub mod retry;
