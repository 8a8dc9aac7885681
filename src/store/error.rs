//! Query Store Error Types

use std::io;
use thiserror::Error;

use crate::query::QueryId;

/// Query store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No query with this id
    #[error("Query not found: {0}")]
    NotFound(QueryId),

    /// A query with this id is already stored
    #[error("Query already exists: {0}")]
    AlreadyExists(QueryId),

    /// Compare-and-set lost: the record changed since it was read
    #[error("Query {id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        id: QueryId,
        expected: u64,
        actual: u64,
    },

    /// I/O error while reading or writing a snapshot
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
