//! Exactly-once distribution of an immutable dataset among many workers.
//!
//! A coordinator persists the elements once with [`Multiplexer::create`] and
//! opens a read session with [`create_read_session`]. Workers open the session
//! id and pull elements; each pull advances the session's control record under
//! a [`DistributedLock`], so every index is handed to exactly one worker.
//!
//! Storage layout under a dataset directory:
//! ```text
//! {location}/{version}/
//!   data.json                    # elements, written once
//!   manifest.json                # element count and creation info
//!   .mux/{session}/info.json     # control record of one read session
//!   .mux/{session}/info.json.lock
//! ```
//!
//! Delivery is at-most-once per element: a worker that crashes after advancing
//! `next` but before processing its element loses that element.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::error::{MuxError, StorageError};
use crate::id::MuxId;
use crate::lock::{DistributedLock, LockConfig};
use crate::store::{join_path, BlobStore, Generation};

const DATA_FILE: &str = "data.json";
const MANIFEST_FILE: &str = "manifest.json";
const MUX_DIR: &str = ".mux";
const INFO_FILE: &str = "info.json";

/// Written next to the data so sessions can be created without decoding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub total: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Control record of a read session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Number of elements in the dataset.
    pub total: u64,
    /// Index of the next element to hand out.
    pub next: u64,
    /// Time of the last update.
    pub time: DateTime<Utc>,
    /// Worker that performed the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl SessionStatus {
    pub fn is_done(&self) -> bool {
        self.next >= self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.next)
    }
}

/// Name of a new dataset directory: `YYYYMMDD-HHMMSS.ffffff[-tag]`.
pub fn make_version(tag: Option<&str>) -> String {
    let version = Utc::now().format("%Y%m%d-%H%M%S%.6f").to_string();
    match tag.map(|t| t.trim_matches(|c| c == ' ' || c == '_' || c == '-')) {
        Some(tag) if !tag.is_empty() => format!("{}-{}", version, tag),
        _ => version,
    }
}

fn new_session_name() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

fn data_path(location: &str) -> String {
    join_path(location, DATA_FILE)
}

fn manifest_path(location: &str) -> String {
    join_path(location, MANIFEST_FILE)
}

fn sessions_dir(location: &str) -> String {
    join_path(location, MUX_DIR)
}

fn info_path(location: &str, session: &str) -> String {
    join_path(&join_path(&sessions_dir(location), session), INFO_FILE)
}

fn to_json<V: Serialize>(value: &V, what: &str) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize {}: {}", what, e)))
}

fn from_json<V: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<V, StorageError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::Serialization(format!("Failed to parse {}: {}", what, e)))
}

// =============================================================================
// Session Operations
// =============================================================================

/// Start a new read session over the dataset named by `dataset`.
///
/// Returns an id bound to the new session; hand it to the workers. Sessions
/// over the same dataset are independent of each other.
#[instrument(skip(store), level = "debug", fields(location = %dataset.location))]
pub async fn create_read_session(store: &dyn BlobStore, dataset: &MuxId) -> Result<MuxId, MuxError> {
    let manifest: DatasetManifest =
        from_json(&store.read(&manifest_path(&dataset.location)).await?, "manifest")?;

    let session = new_session_name();
    let status = SessionStatus {
        total: manifest.total,
        next: 0,
        time: Utc::now(),
        worker_id: None,
    };
    store
        .create_if_absent(
            &info_path(&dataset.location, &session),
            &to_json(&status, "session status")?,
        )
        .await?;

    info!(
        "Created read session {} over {} ({} elements)",
        session, dataset.location, manifest.total
    );
    Ok(dataset.with_session(session))
}

/// Snapshot of a session's control record, read without locking.
pub async fn stat(store: &dyn BlobStore, id: &MuxId) -> Result<SessionStatus, MuxError> {
    let session = id.require_session()?;
    read_status(store, &info_path(&id.location, session), session).await
}

/// Whether every element of the session has been handed out.
pub async fn done(store: &dyn BlobStore, id: &MuxId) -> Result<bool, MuxError> {
    Ok(stat(store, id).await?.is_done())
}

/// Names of all read sessions created over a dataset.
pub async fn list_sessions(store: &dyn BlobStore, dataset: &MuxId) -> Result<Vec<String>, MuxError> {
    let dir = sessions_dir(&dataset.location);
    let prefix = format!("{}/", dir);
    let suffix = format!("/{}", INFO_FILE);
    let mut sessions: Vec<String> = store
        .list(&dir)
        .await?
        .into_iter()
        .filter_map(|path| {
            path.strip_prefix(&prefix)?
                .strip_suffix(&suffix)
                .filter(|s| !s.contains('/'))
                .map(str::to_string)
        })
        .collect();
    sessions.sort();
    Ok(sessions)
}

/// Delete the dataset and every session over it. Returns the number of objects removed.
#[instrument(skip(store), level = "debug", fields(location = %id.location))]
pub async fn destroy(store: &dyn BlobStore, id: &MuxId) -> Result<usize, MuxError> {
    let removed = store.delete_prefix(&id.location).await?;
    info!("Destroyed dataset {} ({} objects)", id.location, removed);
    Ok(removed)
}

async fn read_status(store: &dyn BlobStore, path: &str, session: &str) -> Result<SessionStatus, MuxError> {
    match store.read(path).await {
        Ok(bytes) => Ok(from_json(&bytes, "session status")?),
        Err(e) if e.is_not_found() => Err(MuxError::SessionNotFound(session.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Claim the next index of a session. Must run under the session lock.
async fn advance(
    store: &dyn BlobStore,
    path: &str,
    session: &str,
    worker_id: &str,
) -> Result<Option<u64>, MuxError> {
    let (status, generation) = read_record(store, path, session).await?;
    if status.is_done() {
        return Ok(None);
    }
    commit_advance(store, path, &status, &generation, worker_id)
        .await
        .map(Some)
}

/// The control record together with the generation it was read at.
async fn read_record(
    store: &dyn BlobStore,
    path: &str,
    session: &str,
) -> Result<(SessionStatus, Generation), MuxError> {
    // Generation first: a newer body than the generation makes the commit fail.
    let generation = match store.metadata(path).await {
        Ok(meta) => meta.generation,
        Err(e) if e.is_not_found() => return Err(MuxError::SessionNotFound(session.to_string())),
        Err(e) => return Err(e.into()),
    };
    let status = read_status(store, path, session).await?;
    Ok((status, generation))
}

/// Write `status` advanced by one, only if the record is still at `generation`.
///
/// A holder whose lock was reclaimed mid-pull fails here with
/// `GenerationMismatch` instead of handing out an index twice.
async fn commit_advance(
    store: &dyn BlobStore,
    path: &str,
    status: &SessionStatus,
    generation: &Generation,
    worker_id: &str,
) -> Result<u64, MuxError> {
    let claimed = status.next;
    let updated = SessionStatus {
        total: status.total,
        next: claimed + 1,
        time: Utc::now(),
        worker_id: Some(worker_id.to_string()),
    };
    store
        .replace_if_generation_matches(path, &to_json(&updated, "session status")?, generation)
        .await?;
    Ok(claimed)
}

async fn load_data<T: DeserializeOwned>(store: &dyn BlobStore, path: String) -> Result<Arc<Vec<T>>, MuxError> {
    let data: Vec<T> = from_json(&store.read(&path).await?, "dataset")?;
    debug!("Loaded {} elements from {}", data.len(), path);
    Ok(Arc::new(data))
}

fn default_worker_id() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => format!("pid {} {}", std::process::id(), name),
        None => format!("pid {} {:?}", std::process::id(), thread.id()),
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// A worker's participation in one read session.
///
/// Pulling is sequential within one instance; run one instance per worker.
/// Once exhausted, the instance keeps returning `None`.
pub struct Multiplexer<T> {
    store: Arc<dyn BlobStore>,
    id: MuxId,
    session: String,
    worker_id: String,
    timeout: Option<Duration>,
    lock: DistributedLock,
    data: OnceCell<Arc<Vec<T>>>,
    finished: bool,
}

impl<T: Serialize> Multiplexer<T> {
    /// Persist `elements` under a fresh sub-directory of `location`.
    ///
    /// Returns the dataset id; pass it to [`create_read_session`].
    #[instrument(skip(store, elements), level = "debug")]
    pub async fn create<I>(
        store: &dyn BlobStore,
        elements: I,
        location: &str,
        tag: Option<&str>,
    ) -> Result<MuxId, MuxError>
    where
        I: IntoIterator<Item = T>,
    {
        let elements: Vec<T> = elements.into_iter().collect();
        if elements.is_empty() {
            return Err(MuxError::EmptyDataset);
        }

        let dir = join_path(location, &make_version(tag));
        let manifest = DatasetManifest {
            total: elements.len() as u64,
            created_at: Utc::now(),
            tag: tag.map(str::to_string),
        };
        store
            .create_if_absent(&data_path(&dir), &to_json(&elements, "dataset")?)
            .await?;
        store
            .create_if_absent(&manifest_path(&dir), &to_json(&manifest, "manifest")?)
            .await?;

        info!("Created dataset {} ({} elements)", dir, manifest.total);
        Ok(MuxId::dataset(dir))
    }
}

impl<T: DeserializeOwned + Clone> Multiplexer<T> {
    /// Join the read session named by `id`.
    pub fn open(store: Arc<dyn BlobStore>, id: MuxId) -> Result<Self, MuxError> {
        let session = id.require_session()?.to_string();
        let worker_id = default_worker_id();
        let lock = DistributedLock::for_resource(store.clone(), &info_path(&id.location, &session))
            .with_owner(worker_id.clone());
        Ok(Self {
            store,
            id,
            session,
            worker_id,
            timeout: None,
            lock,
            data: OnceCell::new(),
            finished: false,
        })
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self.lock = self.lock.with_owner(self.worker_id.clone());
        self
    }

    /// Bound on the wait for the session lock at each pull.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock = self.lock.with_config(config);
        self
    }

    pub fn id(&self) -> &MuxId {
        &self.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The full dataset, fetched on first use and cached.
    pub async fn data(&self) -> Result<Arc<Vec<T>>, MuxError> {
        let store: &dyn BlobStore = self.store.as_ref();
        let path = data_path(&self.id.location);
        self.data
            .get_or_try_init(move || load_data(store, path))
            .await
            .cloned()
    }

    pub async fn len(&self) -> Result<usize, MuxError> {
        Ok(self.data().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, MuxError> {
        Ok(self.len().await? == 0)
    }

    /// Snapshot of this session's control record.
    pub async fn stat(&self) -> Result<SessionStatus, MuxError> {
        stat(self.store.as_ref(), &self.id).await
    }

    /// Pull the next element for this worker, or `None` once the session is exhausted.
    #[instrument(skip(self), level = "debug", fields(session = %self.session, worker = %self.worker_id))]
    pub async fn next(&mut self) -> Result<Option<T>, MuxError> {
        if self.finished {
            return Ok(None);
        }
        // Fetch before locking so the locked region only touches the control record.
        let data = self.data().await?;

        let store: &dyn BlobStore = self.store.as_ref();
        let path = info_path(&self.id.location, &self.session);
        let path = path.as_str();
        let session = self.session.as_str();
        let worker_id = self.worker_id.as_str();
        let claimed = self
            .lock
            .with_lock(self.timeout, move || advance(store, path, session, worker_id))
            .await??;

        let Some(index) = claimed else {
            debug!("Session {} exhausted for {}", self.session, self.worker_id);
            self.finished = true;
            return Ok(None);
        };
        debug!("Worker {} claimed index {}", self.worker_id, index);

        let element = usize::try_from(index)
            .ok()
            .and_then(|i| data.get(i))
            .cloned()
            .ok_or_else(|| {
                StorageError::Internal(format!(
                    "Index {} out of range for dataset of {} elements",
                    index,
                    data.len()
                ))
            })?;
        Ok(Some(element))
    }

    /// Consume the multiplexer as a stream of elements.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, MuxError>> {
        futures::stream::try_unfold(self, |mut mux| async move {
            let next = mux.next().await?;
            Ok::<_, MuxError>(next.map(|element| (element, mux)))
        })
    }
}
