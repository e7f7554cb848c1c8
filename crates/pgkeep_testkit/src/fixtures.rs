//! Test fixtures and storage helpers.
//!
//! Provides seeded storage locations and helpers for building WAL names,
//! backup names and backup labels.

use pgkeep_core::{CommandSpec, Config, FilterConfig, StorageConfig, MIN_BACKUP_SIZE};
use pgkeep_storage::{BackendKind, Category, InMemoryBackend, StorageBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Size of a sane test backup.
pub const BACKUP_SIZE: usize = MIN_BACKUP_SIZE as usize + 1024;

/// Size of a backup below the sanity floor.
pub const SMALL_BACKUP_SIZE: usize = 1024 * 1024;

/// Size of a seeded WAL segment.
pub const SEGMENT_SIZE: usize = 1024;

/// Cluster name used by the fixtures.
pub const CLUSTER: &str = "main";

/// Builds a 24 character segment name.
#[must_use]
pub fn segment_name(timeline: u32, counter: u64) -> String {
    format!("{timeline:08X}{counter:016X}")
}

/// Builds the name of a backup taken on day `day` of January 2024.
#[must_use]
pub fn backup_name(day: u32) -> String {
    format!("{CLUSTER}@2024-01-{day:02}T00:00:00Z")
}

/// Builds the archived label name for a backup starting in `segment`.
#[must_use]
pub fn label_object_name(segment: &str) -> String {
    format!("{segment}.00000028.backup")
}

/// Builds backup label text the way the server writes it.
#[must_use]
pub fn label_text(backup: &str, start_segment: &str) -> String {
    format!(
        "START WAL LOCATION: 0/28 (file {start_segment})\n\
         CHECKPOINT LOCATION: 0/60\n\
         BACKUP METHOD: streamed\n\
         BACKUP FROM: primary\n\
         START TIME: 2024-01-01 00:00:00 UTC\n\
         LABEL: {backup}\n\
         START TIMELINE: 1\n"
    )
}

/// Filters that pass bytes through `cat` and add no extension.
#[must_use]
pub fn identity_filters() -> FilterConfig {
    let cat = CommandSpec::new("cat", Vec::<String>::new());
    FilterConfig::default().compression(cat.clone(), cat, "")
}

/// A command that consumes its input and exits with `code`.
#[must_use]
pub fn failing_command(code: i32) -> CommandSpec {
    CommandSpec::new("sh", vec!["-c".to_string(), format!("cat >/dev/null; exit {code}")])
}

/// A storage location pre-populated with backups and WAL.
///
/// Objects are stored unfiltered, matching [`identity_filters`].
pub struct SeededStore {
    backend: Arc<dyn StorageBackend>,
    memory: Option<Arc<InMemoryBackend>>,
    temp_dir: Option<TempDir>,
}

impl SeededStore {
    /// An in-memory store posing as an object store.
    #[must_use]
    pub fn memory() -> Self {
        Self::memory_with_kind(BackendKind::ObjectStore)
    }

    /// An in-memory store posing as the given backend family.
    #[must_use]
    pub fn memory_with_kind(kind: BackendKind) -> Self {
        let memory = Arc::new(InMemoryBackend::with_kind(kind));
        Self {
            backend: memory.clone(),
            memory: Some(memory),
            temp_dir: None,
        }
    }

    /// A filesystem store in a temporary directory.
    pub fn filesystem() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self {
            backend: Arc::new(pgkeep_storage::FileBackend::new(temp_dir.path())),
            memory: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// The backend handle.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    /// The in-memory backend, for failure injection.
    #[must_use]
    pub fn memory_backend(&self) -> Option<&InMemoryBackend> {
        self.memory.as_deref()
    }

    /// Root directory of a filesystem store.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// A configuration pointing at this store with identity filters.
    #[must_use]
    pub fn config(&self) -> Config {
        let config = Config::new().cluster_name(CLUSTER).filters(identity_filters());
        match self.root() {
            Some(root) => config.storage(StorageConfig::filesystem(root)),
            None => config,
        }
    }

    /// Stores an object directly.
    pub fn put(&self, name: &str, category: Category, data: Vec<u8>) {
        if let Some(memory) = &self.memory {
            memory.insert(name, category, data);
            return;
        }
        let root = self.root().expect("store has neither memory nor root");
        let dir = root.join(category.as_str());
        std::fs::create_dir_all(&dir).expect("Failed to create category directory");
        std::fs::write(dir.join(name), data).expect("Failed to write object");
    }

    /// Adds a WAL segment.
    pub fn add_segment(&self, segment: &str) {
        self.put(segment, Category::Wal, vec![0u8; SEGMENT_SIZE]);
    }

    /// Adds a backup taken on `day` together with its label.
    ///
    /// Returns the backup name.
    pub fn add_backup(&self, day: u32, start_segment: &str, size: usize) -> String {
        let name = backup_name(day);
        self.put(&name, Category::Basebackup, vec![0u8; size]);
        self.put(
            &label_object_name(start_segment),
            Category::Wal,
            label_text(&name, start_segment).into_bytes(),
        );
        name
    }

    /// Object names in `category`, sorted.
    #[must_use]
    pub fn names(&self, category: Category) -> Vec<String> {
        if let Some(memory) = &self.memory {
            return memory.names(category);
        }
        let Some(root) = self.root() else {
            return Vec::new();
        };
        let mut names: Vec<String> = match std::fs::read_dir(root.join(category.as_str())) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| !name.starts_with('.'))
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Creates a directory of WAL files as the server's `pg_wal` would hold them.
///
/// Returns the temporary directory and the created paths.
pub fn wal_directory(segments: &[String]) -> (TempDir, Vec<PathBuf>) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let paths = segments
        .iter()
        .map(|segment| {
            let path = dir.path().join(segment);
            std::fs::write(&path, segment.as_bytes()).expect("Failed to write segment");
            path
        })
        .collect();
    (dir, paths)
}
