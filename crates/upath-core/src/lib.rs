//! Core traits and protocols for upath storage backends.
//!
//! This crate defines the storage abstraction and the two protocols built on it:
//! - `BlobStore`: conditional create/replace/delete, reads, metadata, listing
//! - `DistributedLock`: mutual exclusion through a conditionally created marker object
//! - `Multiplexer`: exactly-once distribution of a dataset among many workers
//!
//! Backends implement `BlobStore`; `MemoryStore` is an in-process implementation
//! for tests and single-process use.

mod error;
mod id;
pub mod lock;
mod memory;
pub mod multiplexer;
mod store;

pub use error::{LockError, MuxError, StorageError};
pub use id::MuxId;
pub use lock::{DistributedLock, LockConfig, LockHandle};
pub use memory::MemoryStore;
pub use multiplexer::{DatasetManifest, Multiplexer, SessionStatus};
pub use store::{join_path, BlobStore, Generation, ObjectMeta};
