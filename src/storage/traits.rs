//! Storage traits and error types
//!
//! This module defines the trait the batch writer persists through and the
//! associated error types.

use crate::storage::ItemRecord;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Destination for batches of item records
///
/// A store is owned by exactly one writer. `persist_batch` must be atomic:
/// either every record of the batch lands or none does.
pub trait ItemStore: Send {
    /// Persists one batch in a single transaction
    ///
    /// `observed_at` stamps the current-state rows and the history rows of
    /// this batch. Returns the number of records written.
    fn persist_batch(
        &mut self,
        batch: &[ItemRecord],
        observed_at: DateTime<Utc>,
    ) -> StorageResult<usize>;
}

/// Store used when database output is disabled: accepts and forgets everything
#[derive(Debug, Default)]
pub struct DiscardStore;

impl ItemStore for DiscardStore {
    fn persist_batch(
        &mut self,
        batch: &[ItemRecord],
        _observed_at: DateTime<Utc>,
    ) -> StorageResult<usize> {
        Ok(batch.len())
    }
}
