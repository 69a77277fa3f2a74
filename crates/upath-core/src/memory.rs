use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::store::{BlobStore, Generation, ObjectMeta};

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    generation: Generation,
    created_at: DateTime<Utc>,
}

/// In-memory blob store.
///
/// Conditional operations are atomic with respect to each other because every
/// call runs under a single mutex. Shared between tasks through `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    next_generation: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, MemoryObject>> {
        // A panic while holding the guard cannot leave a map entry half-written.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh_object(&self, data: &[u8]) -> MemoryObject {
        let n = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        MemoryObject {
            data: data.to_vec(),
            generation: Generation::new(n.to_string()),
            created_at: Utc::now(),
        }
    }

    /// Move an object's creation time into the past.
    ///
    /// Lets tests simulate a marker left behind by a crashed holder.
    pub fn backdate(&self, path: &str, age: chrono::Duration) -> Result<(), StorageError> {
        let mut objects = self.objects();
        let object = objects
            .get_mut(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        object.created_at -= age;
        Ok(())
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }
}

fn check_generation(
    path: &str,
    object: Option<&MemoryObject>,
    generation: &Generation,
) -> Result<(), StorageError> {
    match object {
        None => Err(StorageError::NotFound(path.to_string())),
        Some(o) if &o.generation != generation => Err(StorageError::GenerationMismatch {
            path: path.to_string(),
            expected: generation.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn create_if_absent(&self, path: &str, data: &[u8]) -> Result<Generation, StorageError> {
        let mut objects = self.objects();
        if objects.contains_key(path) {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        let object = self.fresh_object(data);
        let generation = object.generation.clone();
        objects.insert(path.to_string(), object);
        debug!("Created {} (generation {})", path, generation);
        Ok(generation)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_if_generation_matches(
        &self,
        path: &str,
        generation: &Generation,
    ) -> Result<(), StorageError> {
        let mut objects = self.objects();
        check_generation(path, objects.get(path), generation)?;
        objects.remove(path);
        Ok(())
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn replace_if_generation_matches(
        &self,
        path: &str,
        data: &[u8],
        generation: &Generation,
    ) -> Result<Generation, StorageError> {
        let mut objects = self.objects();
        check_generation(path, objects.get(path), generation)?;
        let object = self.fresh_object(data);
        let new_generation = object.generation.clone();
        objects.insert(path.to_string(), object);
        Ok(new_generation)
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, path: &str, data: &[u8]) -> Result<Generation, StorageError> {
        let object = self.fresh_object(data);
        let generation = object.generation.clone();
        self.objects().insert(path.to_string(), object);
        Ok(generation)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects()
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMeta, StorageError> {
        self.objects()
            .get(path)
            .map(|o| ObjectMeta {
                generation: o.generation.clone(),
                created_at: o.created_at,
                size_bytes: o.data.len() as u64,
            })
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.objects()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.objects().contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_end_matches('/');
        let objects = self.objects();
        if prefix.is_empty() {
            return Ok(objects.keys().cloned().collect());
        }
        let dir = format!("{}/", prefix);
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(&dir))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = MemoryStore::new();
        let generation = store.create_if_absent("a/marker", b"x").await.unwrap();
        assert_eq!(store.metadata("a/marker").await.unwrap().generation, generation);

        let err = store.create_if_absent("a/marker", b"y").await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.read("a/marker").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let store = MemoryStore::new();
        let old = store.create_if_absent("k", b"1").await.unwrap();
        let new = store.write("k", b"2").await.unwrap();
        assert_ne!(old, new);

        let err = store.delete_if_generation_matches("k", &old).await.unwrap_err();
        assert!(err.is_generation_mismatch());
        assert!(store.exists("k").await.unwrap());

        store.delete_if_generation_matches("k", &new).await.unwrap();
        assert!(!store.exists("k").await.unwrap());

        let err = store.delete_if_generation_matches("k", &new).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_replace_resets_creation_time() {
        let store = MemoryStore::new();
        let generation = store.create_if_absent("k", b"1").await.unwrap();
        store.backdate("k", chrono::Duration::minutes(10)).unwrap();
        let old_created = store.creation_time("k").await.unwrap();

        let replaced = store
            .replace_if_generation_matches("k", b"2", &generation)
            .await
            .unwrap();
        assert_ne!(replaced, generation);
        assert!(store.creation_time("k").await.unwrap() > old_created);

        let err = store
            .replace_if_generation_matches("k", b"3", &generation)
            .await
            .unwrap_err();
        assert!(err.is_generation_mismatch());
    }

    #[tokio::test]
    async fn test_list_and_delete_prefix() {
        let store = MemoryStore::new();
        store.write("ds/data.json", b"[]").await.unwrap();
        store.write("ds/.mux/s1/info.json", b"{}").await.unwrap();
        store.write("ds2/data.json", b"[]").await.unwrap();

        let listed = store.list("ds").await.unwrap();
        assert_eq!(listed, vec!["ds/.mux/s1/info.json", "ds/data.json"]);

        assert_eq!(store.delete_prefix("ds").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.exists("ds2/data.json").await.unwrap());
    }
}
