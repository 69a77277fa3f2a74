use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use upath_core::{BlobStore, Generation, ObjectMeta, StorageError};
use uuid::Uuid;

/// Directory under the root holding store bookkeeping; never listed.
const META_DIR: &str = ".upath";

/// Generation record kept beside each object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    generation: String,
    created_at: DateTime<Utc>,
}

/// Local filesystem blob store.
///
/// Layout:
/// ```text
/// {root}/
///   {key}                   # object bytes
///   .upath/
///     guard                 # fs2 lock serializing mutations
///     meta/{key}.json       # generation and creation time
/// ```
///
/// Every mutation runs under an exclusive lock on the guard file, so
/// check-then-act sequences are atomic across threads and processes sharing
/// the directory. Object bytes are replaced by rename, so unguarded reads
/// never observe a partial write.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new LocalStore rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its object path, rejecting keys that escape the root.
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for (i, part) in key.split('/').enumerate() {
            if part.is_empty() || part == "." || part == ".." || (i == 0 && part == META_DIR) {
                return Err(StorageError::InvalidArgument(format!("Invalid key: {:?}", key)));
            }
            path.push(part);
        }
        Ok(path)
    }

    /// Get the path to an object's sidecar.
    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root
            .join(META_DIR)
            .join("meta")
            .join(format!("{}.json", key))
    }

    /// Run `f` while holding the exclusive guard lock.
    fn with_guard<R>(&self, f: impl FnOnce() -> Result<R, StorageError>) -> Result<R, StorageError> {
        let dir = self.root.join(META_DIR);
        fs::create_dir_all(&dir).map_err(|e| {
            StorageError::Io(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        let guard_path = dir.join("guard");
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| StorageError::Io(format!("Failed to open guard file: {}", e)))?;
        guard
            .lock_exclusive()
            .map_err(|e| StorageError::Io(format!("Failed to lock guard file: {}", e)))?;

        let result = f();

        let _ = FileExt::unlock(&guard);
        result
    }

    /// Run blocking filesystem work off the async runtime.
    async fn blocking<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(LocalStore) -> Result<R, StorageError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StorageError::Internal(format!("Blocking task failed: {}", e)))?
    }

    fn metadata_sync(&self, key: &str) -> Result<ObjectMeta, StorageError> {
        let path = self.object_path(key)?;
        let fs_meta = fs::metadata(&path).map_err(|e| io_error(key, &path, e))?;
        if fs_meta.is_dir() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let sidecar = fs::read(self.sidecar_path(key))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Sidecar>(&bytes).ok());
        let (generation, created_at) = match sidecar {
            Some(s) => (Generation::new(s.generation), s.created_at),
            None => {
                // Written by something other than this store.
                let modified: DateTime<Utc> = fs_meta
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                let nanos = modified.timestamp_nanos_opt().unwrap_or_default();
                (
                    Generation::new(format!("fs-{}-{}", nanos, fs_meta.len())),
                    modified,
                )
            }
        };

        Ok(ObjectMeta {
            generation,
            created_at,
            size_bytes: fs_meta.len(),
        })
    }

    /// Write an object and a fresh sidecar. Caller holds the guard.
    fn put_sync(&self, key: &str, data: &[u8]) -> Result<Generation, StorageError> {
        let path = self.object_path(key)?;
        let generation = Generation::new(Uuid::new_v4().simple().to_string());
        let sidecar = Sidecar {
            generation: generation.to_string(),
            created_at: Utc::now(),
        };
        let sidecar_bytes = serde_json::to_vec(&sidecar).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize sidecar: {}", e))
        })?;

        // Sidecar first: an object without its sidecar would get a derived generation.
        write_atomic(&self.sidecar_path(key), &sidecar_bytes)?;
        write_atomic(&path, data)?;
        Ok(generation)
    }

    fn check_generation_sync(&self, key: &str, expected: &Generation) -> Result<(), StorageError> {
        let current = self.metadata_sync(key)?.generation;
        if &current != expected {
            return Err(StorageError::GenerationMismatch {
                path: key.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// Remove an object and its sidecar. Caller holds the guard.
    fn remove_sync(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if path.is_dir() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::remove_file(&path).map_err(|e| io_error(key, &path, e))?;

        let sidecar = self.sidecar_path(key);
        if let Err(e) = fs::remove_file(&sidecar) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove sidecar {}: {}", sidecar.display(), e);
            }
        }

        prune_empty_dirs(path.parent(), &self.root);
        prune_empty_dirs(sidecar.parent(), &self.root.join(META_DIR).join("meta"));
        Ok(())
    }

    fn list_sync(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_matches('/');
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.object_path(prefix)?
        };
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut keys = Vec::new();
        collect_files(&dir, &self.root, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    // =========================================================================
    // Conditional Operations
    // =========================================================================

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn create_if_absent(&self, path: &str, data: &[u8]) -> Result<Generation, StorageError> {
        let key = path.to_string();
        let data = data.to_vec();
        let generation = self
            .blocking(move |store| {
                let path = store.object_path(&key)?;
                store.with_guard(|| {
                    if path.exists() {
                        return Err(StorageError::AlreadyExists(key.clone()));
                    }
                    store.put_sync(&key, &data)
                })
            })
            .await?;
        debug!("Created {} (generation {})", path, generation);
        Ok(generation)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_if_generation_matches(
        &self,
        path: &str,
        generation: &Generation,
    ) -> Result<(), StorageError> {
        let key = path.to_string();
        let expected = generation.clone();
        self.blocking(move |store| {
            store.with_guard(|| {
                store.check_generation_sync(&key, &expected)?;
                store.remove_sync(&key)
            })
        })
        .await
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn replace_if_generation_matches(
        &self,
        path: &str,
        data: &[u8],
        generation: &Generation,
    ) -> Result<Generation, StorageError> {
        let key = path.to_string();
        let data = data.to_vec();
        let expected = generation.clone();
        self.blocking(move |store| {
            store.with_guard(|| {
                store.check_generation_sync(&key, &expected)?;
                store.put_sync(&key, &data)
            })
        })
        .await
    }

    // =========================================================================
    // Plain Operations
    // =========================================================================

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, path: &str, data: &[u8]) -> Result<Generation, StorageError> {
        let key = path.to_string();
        let data = data.to_vec();
        self.blocking(move |store| store.with_guard(|| store.put_sync(&key, &data)))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let file = self.object_path(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => {
                debug!("Read {} ({} bytes)", path, data.len());
                Ok(data)
            }
            Err(e) => Err(io_error(path, &file, e)),
        }
    }

    async fn metadata(&self, path: &str) -> Result<ObjectMeta, StorageError> {
        let key = path.to_string();
        self.blocking(move |store| store.with_guard(|| store.metadata_sync(&key)))
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let key = path.to_string();
        self.blocking(move |store| store.with_guard(|| store.remove_sync(&key)))
            .await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let file = self.object_path(path)?;
        match tokio::fs::metadata(&file).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) => match io_error(path, &file, e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_string();
        self.blocking(move |store| store.list_sync(&prefix)).await
    }
}

fn io_error(key: &str, path: &Path, e: std::io::Error) -> StorageError {
    // A file where a directory is expected means the key cannot exist either.
    if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(format!("Failed to access {}: {}", path.display(), e))
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

/// Write via a temp file in the same directory and rename into place.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::InvalidArgument(format!("No parent for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| {
        StorageError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
    fs::write(&temp_path, data).map_err(|e| {
        StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
    })
}

/// Remove empty directories from `start` upward, stopping at `stop`.
fn prune_empty_dirs(start: Option<&Path>, stop: &Path) {
    let mut current = start;
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        // Fails harmlessly when the directory is not empty.
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

fn collect_files(dir: &Path, root: &Path, keys: &mut Vec<String>) -> Result<(), StorageError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| StorageError::Io(format!("Failed to read dir {}: {}", dir.display(), e)))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| StorageError::Io(format!("Failed to read dir entry: {}", e)))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if dir == root && name == META_DIR {
            continue;
        }
        let file_type = entry
            .file_type()
            .map_err(|e| StorageError::Io(format!("Failed to get file type: {}", e)))?;
        if file_type.is_dir() {
            collect_files(&path, root, keys)?;
        } else if file_type.is_file() && !is_temp_name(&name) {
            if let Ok(relative) = path.strip_prefix(root) {
                let key: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                keys.push(key.join("/"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let (store, _temp) = setup();

        let generation = store.create_if_absent("a/b/marker", b"one").await.unwrap();
        assert_eq!(store.read("a/b/marker").await.unwrap(), b"one");
        assert_eq!(store.metadata("a/b/marker").await.unwrap().generation, generation);

        let err = store.create_if_absent("a/b/marker", b"two").await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.read("a/b/marker").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_read_missing() {
        let (store, _temp) = setup();
        assert!(store.read("nope").await.unwrap_err().is_not_found());
        assert!(store.metadata("nope").await.unwrap_err().is_not_found());
        assert!(store.delete("nope").await.unwrap_err().is_not_found());
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_below_a_file() {
        let (store, _temp) = setup();
        store.write("a", b"file").await.unwrap();
        assert!(store.exists("a").await.unwrap());
        assert!(!store.exists("a/b").await.unwrap());
        assert!(!store.exists("missing/b").await.unwrap());
        assert!(store.read("a/b").await.unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exists_propagates_io_errors() {
        use std::os::unix::fs::PermissionsExt;

        let (store, temp) = setup();
        store.write("locked/obj", b"x").await.unwrap();
        let dir = temp.path().join("locked");
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores permission bits; only check when they apply.
        let denied = std::fs::metadata(dir.join("obj")).is_err();
        let result = store.exists("locked/obj").await;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        if denied {
            assert!(matches!(result, Err(StorageError::Io(_))));
        } else {
            assert!(result.unwrap());
        }
    }

    #[tokio::test]
    async fn test_conditional_delete_and_replace() {
        let (store, _temp) = setup();
        let first = store.create_if_absent("k", b"1").await.unwrap();
        let second = store.replace_if_generation_matches("k", b"2", &first).await.unwrap();
        assert_ne!(first, second);

        let err = store
            .replace_if_generation_matches("k", b"3", &first)
            .await
            .unwrap_err();
        assert!(err.is_generation_mismatch());
        let err = store.delete_if_generation_matches("k", &first).await.unwrap_err();
        assert!(err.is_generation_mismatch());
        assert_eq!(store.read("k").await.unwrap(), b"2");

        store.delete_if_generation_matches("k", &second).await.unwrap();
        assert!(!store.exists("k").await.unwrap());
        let err = store.delete_if_generation_matches("k", &second).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_resets_creation_time() {
        let (store, _temp) = setup();
        store.write("k", b"1").await.unwrap();
        let created = store.creation_time("k").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.write("k", b"2").await.unwrap();
        assert!(store.creation_time("k").await.unwrap() > created);
    }

    #[tokio::test]
    async fn test_list_skips_bookkeeping() {
        let (store, temp) = setup();
        store.write("ds/data.json", b"[]").await.unwrap();
        store.write("ds/.mux/s1/info.json", b"{}").await.unwrap();
        store.write("other/x", b"x").await.unwrap();
        std::fs::write(temp.path().join("ds/.data.json.abc.tmp"), b"partial").unwrap();

        assert_eq!(
            store.list("ds").await.unwrap(),
            vec!["ds/.mux/s1/info.json", "ds/data.json"]
        );
        assert_eq!(
            store.list("").await.unwrap(),
            vec!["ds/.mux/s1/info.json", "ds/data.json", "other/x"]
        );
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_prefix_prunes_directories() {
        let (store, temp) = setup();
        store.write("ds/data.json", b"[]").await.unwrap();
        store.write("ds/.mux/s1/info.json", b"{}").await.unwrap();

        assert_eq!(store.delete_prefix("ds").await.unwrap(), 2);
        assert!(!temp.path().join("ds").exists());
        assert!(!temp.path().join(META_DIR).join("meta").join("ds").exists());
    }

    #[tokio::test]
    async fn test_invalid_keys() {
        let (store, _temp) = setup();
        for key in ["", "../escape", "a//b", ".upath/guard", "a/./b"] {
            let err = store.write(key, b"x").await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidArgument(_)), "{key}");
        }
    }

    #[tokio::test]
    async fn test_foreign_file_gets_derived_generation() {
        let (store, temp) = setup();
        std::fs::write(temp.path().join("foreign"), b"hello").unwrap();

        let meta = store.metadata("foreign").await.unwrap();
        assert!(meta.generation.as_str().starts_with("fs-"));
        assert_eq!(meta.size_bytes, 5);
        store
            .delete_if_generation_matches("foreign", &meta.generation)
            .await
            .unwrap();
        assert!(!store.exists("foreign").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_single_winner() {
        use tokio::sync::Barrier;

        let (store, _temp) = setup();
        let store = Arc::new(store);
        const NUM_TASKS: usize = 8;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));

        let mut handles = vec![];
        for i in 0..NUM_TASKS {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store
                    .create_if_absent("marker", format!("{}", i).as_bytes())
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task panicked") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
