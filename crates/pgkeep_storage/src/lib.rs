//! # pgkeep Storage
//!
//! Storage backend trait and implementations for pgkeep.
//!
//! This crate provides the lowest-level storage abstraction. Backends are
//! **opaque byte stores** partitioned into two categories (`basebackup` and
//! `wal`) - they do not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Backends stream bytes in and out; nothing is buffered whole except by
//!   the in-memory test double
//! - No knowledge of compression, encryption or WAL naming
//! - Must be `Send + Sync` so operations can fan out across tasks
//! - An object is published only once its full stream was stored
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - Directory per category, temp file + fsync + rename
//! - [`ObjectStoreBackend`] - S3-compatible bucket via rust-s3
//! - [`InMemoryBackend`] - For testing
//!
//! ## Example
//!
//! ```rust
//! use pgkeep_storage::{Category, InMemoryBackend, StorageBackend};
//!
//! # tokio_test_block(async {
//! let backend = InMemoryBackend::new();
//! backend
//!     .write_stream(Box::new(&b"hello world"[..]), "greeting", Category::Wal)
//!     .await
//!     .unwrap();
//! let listed = backend.list(Category::Wal).await.unwrap();
//! assert_eq!(listed[0].size, 11);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod object_store;

pub use backend::{
    BackendKind, BoxedReader, Category, Location, ObjectInfo, ObjectStream, StorageBackend,
    StreamRelease,
};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use object_store::{ObjectStoreBackend, ObjectStoreConfig, DEFAULT_PART_SIZE, MIN_PART_SIZE};
