use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Opaque version token assigned by a backend on every write.
///
/// Used as the precondition of conditional deletes and replaces. Backends are
/// free to choose the representation (GCS generation number, ETag, UUID...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(String);

impl Generation {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub generation: Generation,
    /// Creation time of the current generation. Overwriting an object resets it.
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Storage abstraction consumed by the lock and multiplexer protocols.
///
/// Paths are `/`-separated keys relative to the backend's root. Existence is
/// never cached: every call observes the backend's current state.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the backend identifier (e.g., "local", "memory").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Conditional Operations
    // =========================================================================

    /// Create an object only if nothing exists at `path`.
    ///
    /// Fails with `StorageError::AlreadyExists` otherwise.
    async fn create_if_absent(&self, path: &str, data: &[u8]) -> Result<Generation, StorageError>;

    /// Delete an object only if its current generation equals `generation`.
    ///
    /// Fails with `NotFound` if absent, `GenerationMismatch` if the object was rewritten.
    async fn delete_if_generation_matches(
        &self,
        path: &str,
        generation: &Generation,
    ) -> Result<(), StorageError>;

    /// Overwrite an object only if its current generation equals `generation`.
    async fn replace_if_generation_matches(
        &self,
        path: &str,
        data: &[u8],
        generation: &Generation,
    ) -> Result<Generation, StorageError>;

    // =========================================================================
    // Plain Operations
    // =========================================================================

    /// Create or overwrite an object.
    async fn write(&self, path: &str, data: &[u8]) -> Result<Generation, StorageError>;

    /// Read an object's bytes. Fails with `NotFound` if absent.
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Get an object's metadata. Fails with `NotFound` if absent.
    async fn metadata(&self, path: &str) -> Result<ObjectMeta, StorageError>;

    /// Delete an object unconditionally. Fails with `NotFound` if absent.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Check if an object exists.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// List object paths under `prefix/`, recursively, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Get the creation time of an object's current generation.
    async fn creation_time(&self, path: &str) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.metadata(path).await?.created_at)
    }

    /// Delete every object under `prefix/`. Returns the number of objects removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut removed = 0;
        for path in self.list(prefix).await? {
            match self.delete(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

/// Join path segments with `/`, ignoring empty segments and stray separators.
pub fn join_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, child),
    }
}
