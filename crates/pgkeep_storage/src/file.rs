//! File-based storage backend.

use crate::backend::{
    content_type_for, validate_object_name, BackendKind, BoxedReader, Category, Location,
    ObjectInfo, ObjectStream, StorageBackend, StreamRelease,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

/// A directory-tree storage backend.
///
/// Each [`Category`] maps to a subdirectory of the root:
///
/// ```text
/// <root>/
/// ├─ basebackup/   # main@2024-05-01T10:00:00Z.zst, ...
/// └─ wal/          # 000000010000000000000003.zst, ...
/// ```
///
/// # Durability
///
/// `write_stream` copies into a hidden temporary file in the destination
/// directory, calls `sync_all()`, renames it into place and then syncs the
/// directory. A failed source leaves no file under the final name.
///
/// # Example
///
/// ```no_run
/// use pgkeep_storage::{Category, FileBackend, StorageBackend};
///
/// # async fn demo() -> pgkeep_storage::StorageResult<()> {
/// let backend = FileBackend::new("/var/lib/pgkeep");
/// let source = Box::new(&b"segment bytes"[..]);
/// backend.write_stream(source, "000000010000000000000001", Category::Wal).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Creates a backend rooted at `root`.
    ///
    /// Nothing is created on disk until the first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding `category`.
    #[must_use]
    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.as_str())
    }

    fn object_path(&self, name: &str, category: Category) -> StorageResult<PathBuf> {
        validate_object_name(name)?;
        Ok(self.category_dir(category).join(name))
    }

    async fn write_temp(path: &Path, mut source: BoxedReader) -> StorageResult<u64> {
        let mut file = File::create(path).await?;
        let written = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn sync_dir(dir: &Path) {
        // Directory fsync makes the rename durable; not all platforms allow it.
        let result = async { File::open(dir).await?.sync_all().await }.await;
        if let Err(err) = result {
            debug!(dir = %dir.display(), error = %err, "directory sync skipped");
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn write_stream(
        &self,
        source: BoxedReader,
        name: &str,
        category: Category,
    ) -> StorageResult<u64> {
        let target = self.object_path(name, category)?;
        let dir = self.category_dir(category);
        fs::create_dir_all(&dir).await?;

        let temp = dir.join(format!(".{name}.{}.partial", Uuid::new_v4()));
        match Self::write_temp(&temp, source).await {
            Ok(written) => {
                if let Err(err) = fs::rename(&temp, &target).await {
                    let _ = fs::remove_file(&temp).await;
                    return Err(err.into());
                }
                Self::sync_dir(&dir).await;
                debug!(object = %target.display(), bytes = written, "file written");
                Ok(written)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&temp).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(
                            file = %temp.display(),
                            error = %cleanup,
                            "failed to remove partial file"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn open_stream(&self, name: &str, category: Category) -> StorageResult<ObjectStream> {
        let path = self.object_path(name, category)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(category, name));
            }
            Err(err) => return Err(err.into()),
        };

        let size = file.metadata().await?.len();
        if size == 0 {
            return Err(StorageError::EmptyObject {
                name: name.to_string(),
                size: 0,
            });
        }

        Ok(ObjectStream {
            reader: Box::new(BufReader::new(file)),
            size,
            content_type: Some(content_type_for(name).to_string()),
            release: StreamRelease::immediate(),
        })
    }

    async fn list(&self, category: Category) -> StorageResult<Vec<ObjectInfo>> {
        let dir = self.category_dir(category);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Hidden files are in-flight temporaries.
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            objects.push(ObjectInfo {
                name,
                size: metadata.len(),
                location: Location::Path(entry.path()),
            });
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str, category: Category) -> StorageResult<()> {
        let path = self.object_path(name, category)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::not_found(category, name))
            }
            Err(err) => Err(err.into()),
        }
    }
}
