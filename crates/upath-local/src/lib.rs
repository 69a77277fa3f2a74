//! Local filesystem backend for upath.
//!
//! `LocalStore` implements `BlobStore` over a directory, so the distributed
//! lock and the multiplexer work across processes sharing that directory.

pub mod config;
mod storage;

pub use storage::LocalStore;
