//! Distributed mutual exclusion built on a conditionally created marker object.
//!
//! The lock on a resource is a single marker blob. Whoever creates it with
//! `create_if_absent` holds the lock; releasing deletes it, conditioned on the
//! generation captured at acquisition. A marker older than `LockConfig::expiry`
//! is considered abandoned by a crashed holder and is reclaimed by the next
//! contender. While held, a background task rewrites the marker periodically so
//! a live holder never looks abandoned.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{LockError, StorageError};
use crate::store::{BlobStore, Generation};

/// Tuning knobs for a distributed lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Age after which a marker is treated as abandoned and reclaimed.
    pub expiry: Duration,
    /// Sleep between attempts while the lock is held by someone else.
    pub poll_interval: Duration,
    /// Wait used when `acquire` is called without a timeout.
    pub default_timeout: Duration,
    /// How often a held marker is rewritten. `None` disables renewal.
    pub renew_interval: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        let expiry = Duration::from_secs(120);
        Self {
            expiry,
            poll_interval: Duration::from_millis(50),
            default_timeout: Duration::from_secs(300),
            renew_interval: Some(expiry / 4),
        }
    }
}

/// Path of the marker that guards `resource`.
pub fn marker_path(resource: &str) -> String {
    format!("{}.lock", resource)
}

/// Content of a marker object. Only used for diagnostics and cancellation cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMarker {
    owner: String,
    nonce: String,
    acquired_at: DateTime<Utc>,
}

impl LockMarker {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            nonce: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize lock marker: {}", e))
        })
    }
}

fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What a failed create found at the marker path.
enum MarkerState {
    /// Held by someone else and not expired.
    Live,
    /// Was abandoned and has just been removed.
    Reclaimed,
    /// Disappeared between the failed create and the inspection.
    Vanished,
}

/// A lock on one storage path, owned by one logical holder.
///
/// Acquisition is reentrant per instance: while a handle from this instance is
/// live, further `acquire` calls return immediately without touching storage.
/// Independent holders must use independent instances.
pub struct DistributedLock {
    store: Arc<dyn BlobStore>,
    path: String,
    owner: String,
    config: LockConfig,
    held: Mutex<Weak<HeldLock>>,
}

impl DistributedLock {
    /// Create a lock whose marker lives at `path`.
    pub fn new(store: Arc<dyn BlobStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            owner: format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple()),
            config: LockConfig::default(),
            held: Mutex::new(Weak::new()),
        }
    }

    /// Create a lock guarding `resource`, with the marker at `{resource}.lock`.
    pub fn for_resource(store: Arc<dyn BlobStore>, resource: &str) -> Self {
        Self::new(store, marker_path(resource))
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Whether this instance currently holds the lock.
    pub fn is_held(&self) -> bool {
        lock_state(&self.held)
            .upgrade()
            .is_some_and(|held| held.depth() > 0)
    }

    /// Acquire the lock, waiting up to `timeout` (or `LockConfig::default_timeout`).
    ///
    /// A zero timeout makes exactly one attempt. Contention past the deadline
    /// yields `LockError::Acquire`; backend failures propagate unchanged.
    #[instrument(skip(self), level = "debug", fields(path = %self.path, owner = %self.owner))]
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<LockHandle, LockError> {
        if let Some(handle) = self.reenter() {
            debug!("Reentered lock {} (depth {})", self.path, handle.depth());
            return Ok(handle);
        }

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();
        // Too far out to represent means no deadline at all.
        let deadline = started.checked_add(timeout);

        loop {
            let marker = LockMarker::new(&self.owner);
            let bytes = marker.to_bytes()?;

            let pending = PendingMarker::arm(self.store.clone(), &self.path, &marker.nonce);
            match self.store.create_if_absent(&self.path, &bytes).await {
                Ok(generation) => {
                    pending.disarm();
                    debug!(
                        "Acquired lock {} for {} (generation {})",
                        self.path, self.owner, generation
                    );
                    return Ok(self.install(generation, bytes));
                }
                Err(e) if e.is_already_exists() => pending.disarm(),
                // The create may or may not have landed; the armed guard removes
                // the marker if it carries our nonce.
                Err(e) => return Err(e.into()),
            }

            let state = self.inspect_existing().await?;

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                debug!("Timed out acquiring lock {} after {:?}", self.path, now - started);
                return Err(LockError::Acquire {
                    path: self.path.clone(),
                    waited: now - started,
                });
            }
            match state {
                MarkerState::Live => {
                    let pause = match deadline {
                        Some(deadline) => self.config.poll_interval.min(deadline - now),
                        None => self.config.poll_interval,
                    };
                    tokio::time::sleep(pause).await;
                }
                // Retry at once.
                MarkerState::Reclaimed | MarkerState::Vanished => {}
            }
        }
    }

    /// Release a handle obtained from this lock.
    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        handle.release().await
    }

    /// Run `body` while holding the lock, releasing on every exit path.
    ///
    /// If the returned future is dropped mid-way, the handle's drop schedules
    /// the release in the background.
    pub async fn with_lock<F, Fut, T>(&self, timeout: Option<Duration>, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(timeout).await?;
        let value = body().await;
        handle.release().await?;
        Ok(value)
    }

    fn reenter(&self) -> Option<LockHandle> {
        let held = lock_state(&self.held).upgrade()?;
        if held.enter() {
            Some(LockHandle::new(held))
        } else {
            None
        }
    }

    /// Look at a marker we failed to create, reclaiming it if abandoned.
    async fn inspect_existing(&self) -> Result<MarkerState, LockError> {
        let meta = match self.store.metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Ok(MarkerState::Vanished),
            Err(e) => return Err(e.into()),
        };

        // A creation time in the future (clock skew) counts as fresh.
        let age = match (Utc::now() - meta.created_at).to_std() {
            Ok(age) => age,
            Err(_) => return Ok(MarkerState::Live),
        };
        if age < self.config.expiry {
            return Ok(MarkerState::Live);
        }

        warn!(
            "Reclaiming dead lock marker {} (age {:?}, generation {})",
            self.path, age, meta.generation
        );
        match self
            .store
            .delete_if_generation_matches(&self.path, &meta.generation)
            .await
        {
            Ok(()) => Ok(MarkerState::Reclaimed),
            // Someone else reclaimed or replaced it first.
            Err(e) if e.is_not_found() || e.is_generation_mismatch() => Ok(MarkerState::Reclaimed),
            Err(e) => Err(e.into()),
        }
    }

    fn install(&self, generation: Generation, marker: Vec<u8>) -> LockHandle {
        let generation = Arc::new(Mutex::new(generation));
        let lost = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);

        let renewal = self.config.renew_interval.map(|interval| {
            tokio::spawn(renew_marker(
                self.store.clone(),
                self.path.clone(),
                marker,
                generation.clone(),
                lost.clone(),
                interval,
                stop_rx,
            ))
        });

        let held = Arc::new(HeldLock {
            store: self.store.clone(),
            path: self.path.clone(),
            depth: Mutex::new(1),
            generation,
            lost,
            stop: stop_tx,
            renewal: Mutex::new(renewal),
        });
        *lock_state(&self.held) = Arc::downgrade(&held);
        LockHandle::new(held)
    }
}

/// Shared state of an acquired lock: reentrancy depth, current generation,
/// and the renewal task.
struct HeldLock {
    store: Arc<dyn BlobStore>,
    path: String,
    depth: Mutex<usize>,
    generation: Arc<Mutex<Generation>>,
    lost: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl HeldLock {
    fn depth(&self) -> usize {
        *lock_state(&self.depth)
    }

    /// Increment the depth, unless the lock is already being released.
    fn enter(&self) -> bool {
        let mut depth = lock_state(&self.depth);
        if *depth == 0 {
            return false;
        }
        *depth += 1;
        true
    }

    /// Decrement the depth. Returns true when this was the outermost holder.
    fn leave(&self) -> bool {
        let mut depth = lock_state(&self.depth);
        *depth = depth.saturating_sub(1);
        *depth == 0
    }

    /// Stop renewal and package what is needed to delete the marker.
    fn begin_release(&self) -> ReleaseMarker {
        let _ = self.stop.send(true);
        ReleaseMarker {
            store: self.store.clone(),
            path: self.path.clone(),
            generation: self.generation.clone(),
            renewal: lock_state(&self.renewal).take(),
        }
    }
}

struct ReleaseMarker {
    store: Arc<dyn BlobStore>,
    path: String,
    generation: Arc<Mutex<Generation>>,
    renewal: Option<JoinHandle<()>>,
}

impl ReleaseMarker {
    async fn run(self) -> Result<(), LockError> {
        // Let an in-flight renewal finish so the generation below is current.
        if let Some(task) = self.renewal {
            let _ = task.await;
        }
        let generation = lock_state(&self.generation).clone();

        match self
            .store
            .delete_if_generation_matches(&self.path, &generation)
            .await
        {
            Ok(()) => {
                debug!("Released lock {} (generation {})", self.path, generation);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Lock {} already gone at release", self.path);
                Ok(())
            }
            Err(e) => Err(LockError::Release {
                path: self.path,
                source: e,
            }),
        }
    }
}

/// Proof of holding a distributed lock.
///
/// Each handle accounts for one level of reentrancy. Prefer `release`; a handle
/// that is dropped unreleased releases in the background.
pub struct LockHandle {
    held: Arc<HeldLock>,
    released: bool,
}

impl LockHandle {
    fn new(held: Arc<HeldLock>) -> Self {
        Self {
            held,
            released: false,
        }
    }

    /// Path of the marker object.
    pub fn path(&self) -> &str {
        &self.held.path
    }

    /// Generation of the marker as last written by this holder.
    pub fn generation(&self) -> Generation {
        lock_state(&self.held.generation).clone()
    }

    /// Current reentrancy depth across all handles of this acquisition.
    pub fn depth(&self) -> usize {
        self.held.depth()
    }

    /// Whether renewal found the marker reclaimed or replaced by someone else.
    pub fn is_lost(&self) -> bool {
        self.held.lost.load(Ordering::SeqCst)
    }

    /// Release one level. The outermost release deletes the marker, conditioned
    /// on its generation; a marker that is already gone is not an error.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        if !self.held.leave() {
            debug!("Left lock {} (depth {})", self.held.path, self.held.depth());
            return Ok(());
        }
        self.held.begin_release().run().await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released || !self.held.leave() {
            return;
        }
        let job = self.held.begin_release();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Lock {} dropped while held, releasing in background", job.path);
                runtime.spawn(async move {
                    let path = job.path.clone();
                    if let Err(e) = job.run().await {
                        warn!("Background release of {} failed: {}", path, e);
                    }
                });
            }
            Err(_) => warn!(
                "Lock {} dropped outside a runtime; marker left until it expires",
                job.path
            ),
        }
    }
}

/// Removes a marker whose creation was interrupted before its outcome was known.
struct PendingMarker {
    store: Option<Arc<dyn BlobStore>>,
    path: String,
    nonce: String,
}

impl PendingMarker {
    fn arm(store: Arc<dyn BlobStore>, path: &str, nonce: &str) -> Self {
        Self {
            store: Some(store),
            path: path.to_string(),
            nonce: nonce.to_string(),
        }
    }

    fn disarm(mut self) {
        self.store = None;
    }
}

impl Drop for PendingMarker {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        let nonce = std::mem::take(&mut self.nonce);
        runtime.spawn(async move {
            if let Err(e) = remove_if_ours(store.as_ref(), &path, &nonce).await {
                warn!("Failed to clean up interrupted lock marker {}: {}", path, e);
            }
        });
    }
}

async fn remove_if_ours(store: &dyn BlobStore, path: &str, nonce: &str) -> Result<(), StorageError> {
    // Metadata first: if the content read below is newer, the delete fails on generation.
    let meta = match store.metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let bytes = match store.read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    let ours = serde_json::from_slice::<LockMarker>(&bytes).is_ok_and(|m| m.nonce == nonce);
    if !ours {
        return Ok(());
    }
    debug!("Removing interrupted lock marker {}", path);
    match store.delete_if_generation_matches(path, &meta.generation).await {
        Err(e) if !e.is_not_found() && !e.is_generation_mismatch() => Err(e),
        _ => Ok(()),
    }
}

/// Rewrite the marker every `interval` until told to stop or the marker is lost.
async fn renew_marker(
    store: Arc<dyn BlobStore>,
    path: String,
    marker: Vec<u8>,
    generation: Arc<Mutex<Generation>>,
    lost: Arc<AtomicBool>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let current = lock_state(&generation).clone();
        match store
            .replace_if_generation_matches(&path, &marker, &current)
            .await
        {
            Ok(renewed) => {
                debug!("Renewed lock {} (generation {})", path, renewed);
                *lock_state(&generation) = renewed;
            }
            Err(e) if e.is_not_found() || e.is_generation_mismatch() => {
                warn!("Lock {} was lost before release: {}", path, e);
                lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => warn!("Failed to renew lock {}: {}", path, e),
        }
    }
}
