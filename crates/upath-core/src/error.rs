use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Generation mismatch on {path} (expected {expected})")]
    GenerationMismatch { path: String, expected: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }

    pub fn is_generation_mismatch(&self) -> bool {
        matches!(self, StorageError::GenerationMismatch { .. })
    }
}

/// Errors raised by the distributed lock.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock could not be acquired before the deadline.
    #[error("Failed to acquire lock {path} within {waited:?}")]
    Acquire { path: String, waited: Duration },

    /// The conditional delete of the marker failed for a reason other than
    /// the marker already being gone.
    #[error("Failed to release lock {path}: {source}")]
    Release {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LockError {
    /// Whether this is a contention timeout rather than a backend failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::Acquire { .. })
    }
}

/// Errors raised by the multiplexer.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Cannot create a multiplexer from an empty dataset")]
    EmptyDataset,

    #[error("Read session not found: {0}")]
    SessionNotFound(String),

    #[error("Identifier does not name a read session: {0}")]
    MissingSession(String),

    #[error("Invalid multiplexer id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
