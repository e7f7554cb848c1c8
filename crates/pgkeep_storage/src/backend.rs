//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;

/// An owned, type-erased byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The namespace an object lives in.
///
/// Basebackups and WAL segments never share a namespace, so the same name
/// may be used in both without conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Full physical backups of a data directory.
    Basebackup,
    /// Archived write-ahead log segments, backup labels and history files.
    Wal,
}

impl Category {
    /// Both categories, in a stable order.
    pub const ALL: [Category; 2] = [Category::Basebackup, Category::Wal];

    /// Returns the on-storage name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Basebackup => "basebackup",
            Category::Wal => "wal",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which family of backend an object lives on.
///
/// Retention uses this to pick a deletion strategy: filesystem deletes run
/// sequentially, object store deletes fan out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A local (or mounted) directory tree.
    Filesystem,
    /// An S3-compatible bucket.
    ObjectStore,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Filesystem => f.write_str("filesystem"),
            BackendKind::ObjectStore => f.write_str("object store"),
        }
    }
}

/// Where a listed object physically lives.
///
/// Exactly one of a path or a bucket key: the enum makes "both" and
/// "neither" unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// A key inside an object store bucket.
    Object {
        /// Bucket name.
        bucket: String,
        /// Full object key, including any category prefix.
        key: String,
    },
}

impl Location {
    /// Returns true if the location points at something addressable.
    #[must_use]
    pub fn is_resolvable(&self) -> bool {
        match self {
            Location::Path(path) => !path.as_os_str().is_empty(),
            Location::Object { bucket, key } => !bucket.is_empty() && !key.is_empty(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Path(path) => write!(f, "{}", path.display()),
            Location::Object { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

/// A single object as reported by [`StorageBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object name including its extension, without any category prefix.
    pub name: String,
    /// Stored size in bytes.
    pub size: u64,
    /// Physical location.
    pub location: Location,
}

/// Completion half of an opened stream.
///
/// Some backends produce the stream from a background task (the object store
/// copies the HTTP body into a pipe). [`StreamRelease::wait`] resolves once
/// that producer has finished, which only happens after the consumer has
/// read the pipe to its end or dropped it.
#[derive(Debug)]
pub struct StreamRelease {
    producer: Option<JoinHandle<StorageResult<()>>>,
}

impl StreamRelease {
    /// A release for streams with no background producer.
    #[must_use]
    pub fn immediate() -> Self {
        Self { producer: None }
    }

    /// A release that waits for the given producer task.
    #[must_use]
    pub fn from_task(producer: JoinHandle<StorageResult<()>>) -> Self {
        Self {
            producer: Some(producer),
        }
    }

    /// Waits for the producer to finish and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the producer's error, or [`StorageError::Producer`] if the
    /// task panicked.
    pub async fn wait(self) -> StorageResult<()> {
        match self.producer {
            None => Ok(()),
            Some(handle) => handle
                .await
                .map_err(|err| StorageError::Producer(err.to_string()))?,
        }
    }
}

/// An object opened for reading.
pub struct ObjectStream {
    /// The object's bytes.
    pub reader: BoxedReader,
    /// Size reported by the backend. Always greater than zero.
    pub size: u64,
    /// Content type reported by the backend or guessed from the extension.
    pub content_type: Option<String>,
    /// Completion handle for the producing side.
    pub release: StreamRelease,
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// A storage backend for backups and WAL segments.
///
/// Backends are **opaque byte stores** partitioned into two [`Category`]
/// namespaces. They know nothing about compression, encryption or the WAL
/// naming grammar.
///
/// # Invariants
///
/// - `write_stream` never leaves a readable object behind when the source
///   fails: the object becomes visible only after the source reached a
///   clean end of stream and the bytes are durable
/// - `open_stream` fails for missing objects and for objects of size zero
/// - `delete` reports a missing object as an error instead of succeeding
/// - No method panics on storage failures
///
/// # Implementors
///
/// - [`super::FileBackend`] - Directory per category
/// - [`super::ObjectStoreBackend`] - S3-compatible bucket
/// - [`super::InMemoryBackend`] - For testing
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the backend family.
    fn kind(&self) -> BackendKind;

    /// Persists the full `source` stream as `name` under `category`.
    ///
    /// Creates the destination container (directory or bucket) if needed.
    /// Returns the number of bytes stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails, the name is invalid, or the
    /// backend cannot store the data. In every error case no object named
    /// `name` is published.
    async fn write_stream(
        &self,
        source: BoxedReader,
        name: &str,
        category: Category,
    ) -> StorageResult<u64>;

    /// Opens `name` under `category` for streaming reads.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for missing objects and
    /// [`StorageError::EmptyObject`] if the reported size is not positive.
    async fn open_stream(&self, name: &str, category: Category) -> StorageResult<ObjectStream>;

    /// Lists every object in `category`, ordered by name.
    ///
    /// A category that was never written to lists as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing itself fails.
    async fn list(&self, category: Category) -> StorageResult<Vec<ObjectInfo>>;

    /// Removes `name` from `category`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist, or
    /// the underlying failure.
    async fn delete(&self, name: &str, category: Category) -> StorageResult<()>;
}

/// Rejects names that could escape a category or collide with temporaries.
pub(crate) fn validate_object_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Guesses a content type from the trailing extension of an object name.
pub(crate) fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("zst") => "application/zstd",
        Some("gz") => "application/gzip",
        Some("lz4") => "application/x-lz4",
        Some("tar") => "application/x-tar",
        _ => "application/octet-stream",
    }
}
