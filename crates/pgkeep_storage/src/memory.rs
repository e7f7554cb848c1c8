//! In-memory storage backend for testing.

use crate::backend::{
    content_type_for, validate_object_name, BackendKind, BoxedReader, Category, Location,
    ObjectInfo, ObjectStream, StorageBackend, StreamRelease,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use tokio::io::AsyncReadExt;

/// Bucket name reported in [`Location`]s of in-memory objects.
const MEMORY_BUCKET: &str = "memory";

/// An in-memory storage backend.
///
/// This backend stores all objects in memory and is suitable for:
/// - Unit tests
/// - Integration tests of retention and pipeline flows
///
/// It can pose as either backend family (see [`InMemoryBackend::with_kind`])
/// so both deletion strategies can be exercised, and it supports injecting
/// per-object delete failures.
///
/// # Example
///
/// ```rust
/// use pgkeep_storage::{Category, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.insert("000000010000000000000001", Category::Wal, b"segment".to_vec());
/// assert!(backend.contains("000000010000000000000001", Category::Wal));
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    kind: BackendKind,
    objects: RwLock<BTreeMap<(Category, String), Bytes>>,
    failing_deletes: RwLock<HashSet<String>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_kind(BackendKind::ObjectStore)
    }
}

impl InMemoryBackend {
    /// Creates a new empty backend posing as an object store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty backend reporting the given kind.
    #[must_use]
    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            objects: RwLock::new(BTreeMap::new()),
            failing_deletes: RwLock::new(HashSet::new()),
        }
    }

    /// Stores an object directly, bypassing the streaming path.
    pub fn insert(&self, name: &str, category: Category, data: impl Into<Bytes>) {
        self.objects
            .write()
            .insert((category, name.to_string()), data.into());
    }

    /// Returns a copy of an object's bytes.
    #[must_use]
    pub fn get(&self, name: &str, category: Category) -> Option<Bytes> {
        self.objects
            .read()
            .get(&(category, name.to_string()))
            .cloned()
    }

    /// Returns true if the object exists.
    #[must_use]
    pub fn contains(&self, name: &str, category: Category) -> bool {
        self.objects
            .read()
            .contains_key(&(category, name.to_string()))
    }

    /// Returns the names stored under `category`, in order.
    #[must_use]
    pub fn names(&self, category: Category) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(c, _)| *c == category)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Makes every future delete of `name` fail with an I/O error.
    pub fn fail_deletes_of(&self, name: &str) {
        self.failing_deletes.write().insert(name.to_string());
    }

    /// Removes all objects.
    pub fn clear(&self) {
        self.objects.write().clear();
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn write_stream(
        &self,
        mut source: BoxedReader,
        name: &str,
        category: Category,
    ) -> StorageResult<u64> {
        validate_object_name(name)?;
        let mut buffer = Vec::new();
        source.read_to_end(&mut buffer).await?;
        let written = buffer.len() as u64;
        self.insert(name, category, buffer);
        Ok(written)
    }

    async fn open_stream(&self, name: &str, category: Category) -> StorageResult<ObjectStream> {
        let data = self
            .get(name, category)
            .ok_or_else(|| StorageError::not_found(category, name))?;
        if data.is_empty() {
            return Err(StorageError::EmptyObject {
                name: name.to_string(),
                size: 0,
            });
        }

        Ok(ObjectStream {
            size: data.len() as u64,
            reader: Box::new(Cursor::new(data)),
            content_type: Some(content_type_for(name).to_string()),
            release: StreamRelease::immediate(),
        })
    }

    async fn list(&self, category: Category) -> StorageResult<Vec<ObjectInfo>> {
        let objects = self.objects.read();
        Ok(objects
            .iter()
            .filter(|((c, _), _)| *c == category)
            .map(|((c, name), data)| ObjectInfo {
                name: name.clone(),
                size: data.len() as u64,
                location: Location::Object {
                    bucket: MEMORY_BUCKET.to_string(),
                    key: format!("{c}/{name}"),
                },
            })
            .collect())
    }

    async fn delete(&self, name: &str, category: Category) -> StorageResult<()> {
        if self.failing_deletes.read().contains(name) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("injected delete failure for {name}"),
            )));
        }
        self.objects
            .write()
            .remove(&(category, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(category, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_write_then_open() {
        let backend = InMemoryBackend::new();
        let written = backend
            .write_stream(Box::new(&b"payload"[..]), "obj", Category::Basebackup)
            .await
            .unwrap();
        assert_eq!(written, 7);

        let mut stream = backend
            .open_stream("obj", Category::Basebackup)
            .await
            .unwrap();
        let mut data = Vec::new();
        stream.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(&data, b"payload");
    }

    #[tokio::test]
    async fn memory_categories_are_separate() {
        let backend = InMemoryBackend::new();
        backend.insert("same", Category::Wal, b"w".to_vec());
        backend.insert("same", Category::Basebackup, b"bb".to_vec());

        assert_eq!(backend.list(Category::Wal).await.unwrap()[0].size, 1);
        assert_eq!(backend.list(Category::Basebackup).await.unwrap()[0].size, 2);
    }

    #[tokio::test]
    async fn memory_open_missing_or_empty_fails() {
        let backend = InMemoryBackend::new();
        backend.insert("empty", Category::Wal, Vec::new());

        assert!(matches!(
            backend.open_stream("missing", Category::Wal).await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            backend.open_stream("empty", Category::Wal).await,
            Err(StorageError::EmptyObject { .. })
        ));
    }

    #[tokio::test]
    async fn memory_delete_twice_and_injected_failure() {
        let backend = InMemoryBackend::with_kind(BackendKind::Filesystem);
        backend.insert("a", Category::Wal, b"x".to_vec());
        backend.insert("b", Category::Wal, b"x".to_vec());
        backend.fail_deletes_of("b");

        backend.delete("a", Category::Wal).await.unwrap();
        assert!(backend.delete("a", Category::Wal).await.unwrap_err().is_not_found());
        assert!(backend.delete("b", Category::Wal).await.is_err());
        assert!(backend.contains("b", Category::Wal));
        assert_eq!(backend.kind(), BackendKind::Filesystem);
    }

    #[test]
    fn memory_names_in_order() {
        let backend = InMemoryBackend::new();
        backend.insert("c", Category::Wal, b"x".to_vec());
        backend.insert("a", Category::Wal, b"x".to_vec());
        assert_eq!(backend.names(Category::Wal), vec!["a", "c"]);
        backend.clear();
        assert!(backend.names(Category::Wal).is_empty());
    }
}
