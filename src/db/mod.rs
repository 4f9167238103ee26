pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::error::CacheError;

/// Database connection wrapper for local storage
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`, or at the default location
  pub fn open(path: Option<&Path>) -> Result<Self, CacheError> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Storage(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      CacheError::Storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a throwaway in-memory database
  pub fn open_in_memory() -> Result<Self, CacheError> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf, CacheError> {
    let data_dir = crate::config::data_dir()
      .ok_or_else(|| CacheError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("store.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<(), CacheError> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| CacheError::Storage(format!("Failed to run migrations: {}", e)))?;
    Ok(())
  }

  /// Hand the connection over to a storage backend
  pub fn into_connection(self) -> Connection {
    self.conn
  }
}
