//! Error types for ingestion, stock updates and their backing stores
//!
//! Per-record problems (bad fields, missing references, rolled-back batches)
//! are not errors here: they are reported as conflicts inside the outcome of
//! an attempt. The enums below cover what stops an operation as a whole.

use thiserror::Error;
use uuid::Uuid;

use crate::ingest::attempt::AttemptState;

/// Errors raised by a production, key-value or session store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    // serialization_failure, deadlock_detected, lock_not_available
                    Some("40001") | Some("40P01") | Some("55P03")
                ),
                _ => false,
            },
            StoreError::Backend(_) => true,
            StoreError::Constraint(_) | StoreError::Serialization(_) => false,
        }
    }
}

/// Errors from the idempotency ledger
#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("Idempotency entry not found: {key}")]
    NotFound { key: String },

    #[error("Idempotency entry {key} is {status}, expected pending")]
    NotPending { key: String, status: String },

    #[error("Idempotency entry {key} changed concurrently")]
    Contended { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the chunk/session tracker
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Upload session not found: {0}")]
    NotFound(Uuid),

    #[error("Upload session {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Chunk index {index} out of range for session with {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("Declared chunk total must be at least 1, got {0}")]
    InvalidTotal(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that abort an ingestion attempt
#[derive(Error, Debug)]
pub enum IngestError {
    /// The input cannot be interpreted at all (unknown entity kind,
    /// unsupported format, unreadable stream)
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Idempotency key '{key}' was already used with a different request")]
    IdempotencyKeyConflict { key: String },

    #[error("Deadline exceeded during {state}")]
    DeadlineExceeded { state: AttemptState },

    #[error("Invalid attempt transition from {from} to {to}")]
    InvalidTransition { from: AttemptState, to: AttemptState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether the same request may be resubmitted unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::DeadlineExceeded { .. } => true,
            IngestError::Store(err) => err.is_retryable(),
            IngestError::Idempotency(IdempotencyError::Store(err)) => err.is_retryable(),
            IngestError::Idempotency(IdempotencyError::Contended { .. }) => true,
            IngestError::Session(SessionError::Store(err)) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Errors that abort a stock update batch as a whole
#[derive(Error, Debug)]
pub enum StockError {
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("No valid stock events found")]
    NoValidEvents,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Backend("connection reset".into()).is_retryable());
        assert!(!StoreError::Constraint("duplicate key".into()).is_retryable());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_retryable());

        let err = IngestError::DeadlineExceeded {
            state: AttemptState::Validating,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Deadline exceeded during validating");

        assert!(!IngestError::Structural("unknown kind".into()).is_retryable());
    }
}
