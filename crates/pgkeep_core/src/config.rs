//! Typed configuration.
//!
//! A [`Config`] is built once (by the CLI or by an embedding program) and
//! handed to every operation. The core never reads environment variables or
//! configuration files itself.

use crate::error::{CoreError, CoreResult};
use pgkeep_storage::{
    BackendKind, FileBackend, ObjectStoreBackend, ObjectStoreConfig, StorageBackend,
    MIN_PART_SIZE,
};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Placeholder in the basebackup command replaced by the backup name.
pub const LABEL_PLACEHOLDER: &str = "{label}";

/// An external program and its arguments.
///
/// Parsed from a whitespace separated string; no shell quoting is applied.
///
/// ```rust
/// use pgkeep_core::CommandSpec;
///
/// let spec: CommandSpec = "zstd -q -c".parse().unwrap();
/// assert_eq!(spec.program, "zstd");
/// assert_eq!(spec.args, vec!["-q", "-c"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns a copy with every `{label}` in the arguments replaced.
    #[must_use]
    pub fn with_label(&self, label: &str) -> Self {
        Self {
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|arg| arg.replace(LABEL_PLACEHOLDER, label))
                .collect(),
        }
    }
}

impl FromStr for CommandSpec {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| CoreError::invalid_config("empty command"))?;
        Ok(Self::new(program, parts))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Where backups and WAL segments are stored.
///
/// Exactly one of `path` and `object_store` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    /// Root directory for the filesystem backend.
    pub path: Option<PathBuf>,
    /// Settings for the object store backend.
    pub object_store: Option<ObjectStoreConfig>,
}

impl StorageConfig {
    /// Filesystem storage rooted at `path`.
    pub fn filesystem(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            object_store: None,
        }
    }

    /// Object store storage.
    #[must_use]
    pub fn object_store(config: ObjectStoreConfig) -> Self {
        Self {
            path: None,
            object_store: Some(config),
        }
    }

    /// Returns the configured backend family.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if both or neither location is set.
    pub fn kind(&self) -> CoreResult<BackendKind> {
        match (&self.path, &self.object_store) {
            (Some(_), None) => Ok(BackendKind::Filesystem),
            (None, Some(_)) => Ok(BackendKind::ObjectStore),
            (Some(_), Some(_)) => Err(CoreError::invalid_config(
                "both a storage path and an object store bucket are configured",
            )),
            (None, None) => Err(CoreError::invalid_config(
                "neither a storage path nor an object store bucket is configured",
            )),
        }
    }

    /// Builds the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is ambiguous or the object
    /// store client cannot be created.
    pub fn open(&self) -> CoreResult<Arc<dyn StorageBackend>> {
        match (self.kind()?, &self.path, &self.object_store) {
            (BackendKind::Filesystem, Some(path), _) => Ok(Arc::new(FileBackend::new(path))),
            (BackendKind::ObjectStore, _, Some(store)) => {
                Ok(Arc::new(ObjectStoreBackend::new(store.clone())?))
            }
            _ => Err(CoreError::invalid_config("storage location is incomplete")),
        }
    }
}

/// External filter programs applied to every transfer.
///
/// Outbound data runs through `compress` then `encrypt`; inbound data runs
/// through `decrypt` then `decompress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Compression command reading stdin and writing stdout.
    pub compress: CommandSpec,
    /// Decompression command.
    pub decompress: CommandSpec,
    /// Optional encryption command.
    pub encrypt: Option<CommandSpec>,
    /// Optional decryption command. Required whenever `encrypt` is set.
    pub decrypt: Option<CommandSpec>,
    /// Extension appended to stored object names, e.g. `.zst`.
    pub extension: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            compress: CommandSpec::new("zstd", ["-q", "-c"]),
            decompress: CommandSpec::new("zstd", ["-q", "-d", "-c"]),
            encrypt: None,
            decrypt: None,
            extension: ".zst".to_string(),
        }
    }
}

impl FilterConfig {
    /// Sets the compression pair and the matching extension.
    #[must_use]
    pub fn compression(
        mut self,
        compress: CommandSpec,
        decompress: CommandSpec,
        extension: impl Into<String>,
    ) -> Self {
        self.compress = compress;
        self.decompress = decompress;
        self.extension = extension.into();
        self
    }

    /// Sets the encryption pair.
    #[must_use]
    pub fn encryption(mut self, encrypt: CommandSpec, decrypt: CommandSpec) -> Self {
        self.encrypt = Some(encrypt);
        self.decrypt = Some(decrypt);
        self
    }

    /// Returns the stored object name for `name`.
    #[must_use]
    pub fn object_name(&self, name: &str) -> String {
        format!("{name}{}", self.extension)
    }
}

/// Configuration shared by every operation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster name used as the basebackup name prefix.
    pub cluster_name: String,

    /// Primary storage location.
    pub storage: StorageConfig,

    /// Filter programs.
    pub filters: FilterConfig,

    /// Number of most recent sane basebackups kept by cleanup.
    pub retain: NonZeroUsize,

    /// Concurrent deletes against an object store.
    pub delete_parallelism: NonZeroUsize,

    /// Command producing a tar stream of the data directory on stdout.
    pub basebackup_command: CommandSpec,

    /// Additional filesystem roots pruned alongside the primary storage.
    ///
    /// Each root uses the storage layout, so WAL is expected under
    /// `<dir>/wal/`. Files directly in `<dir>` are never touched.
    pub wal_archive_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "main".to_string(),
            storage: StorageConfig::default(),
            filters: FilterConfig::default(),
            retain: NonZeroUsize::MIN.saturating_add(1), // 2
            delete_parallelism: NonZeroUsize::MIN.saturating_add(7), // 8
            basebackup_command: CommandSpec::new(
                "pg_basebackup",
                ["-D", "-", "-F", "tar", "-X", "fetch", "-c", "fast", "-l", LABEL_PLACEHOLDER],
            ),
            wal_archive_dirs: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cluster name.
    #[must_use]
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Sets the primary storage location.
    #[must_use]
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the filter programs.
    #[must_use]
    pub fn filters(mut self, filters: FilterConfig) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the retention quota.
    #[must_use]
    pub const fn retain(mut self, count: NonZeroUsize) -> Self {
        self.retain = count;
        self
    }

    /// Sets the object store delete parallelism.
    #[must_use]
    pub const fn delete_parallelism(mut self, workers: NonZeroUsize) -> Self {
        self.delete_parallelism = workers;
        self
    }

    /// Sets the basebackup source command.
    #[must_use]
    pub fn basebackup_command(mut self, command: CommandSpec) -> Self {
        self.basebackup_command = command;
        self
    }

    /// Adds a filesystem root pruned together with the primary storage.
    ///
    /// WAL in it must live under `<dir>/wal/`.
    #[must_use]
    pub fn wal_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal_archive_dirs.push(dir.into());
        self
    }

    /// Checks the configuration for inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.cluster_name.is_empty() {
            return Err(CoreError::invalid_config("cluster name is empty"));
        }
        if self
            .cluster_name
            .contains(|c: char| c == '@' || c == '/' || c.is_whitespace())
        {
            return Err(CoreError::invalid_config(format!(
                "cluster name {:?} may not contain '@', '/' or whitespace",
                self.cluster_name
            )));
        }

        self.storage.kind()?;
        if let Some(store) = &self.storage.object_store {
            if store.bucket.is_empty() {
                return Err(CoreError::invalid_config("object store bucket is empty"));
            }
            if store.part_size < MIN_PART_SIZE {
                return Err(CoreError::invalid_config(format!(
                    "multipart part size {} is below the minimum of {MIN_PART_SIZE}",
                    store.part_size
                )));
            }
        }

        match (&self.filters.encrypt, &self.filters.decrypt) {
            (Some(_), None) => {
                return Err(CoreError::invalid_config(
                    "an encrypt command requires a decrypt command",
                ))
            }
            (None, Some(_)) => {
                return Err(CoreError::invalid_config(
                    "a decrypt command requires an encrypt command",
                ))
            }
            _ => {}
        }

        let ext = &self.filters.extension;
        if !ext.is_empty() && !ext.starts_with('.') {
            return Err(CoreError::invalid_config(format!(
                "extension {ext:?} must start with '.'"
            )));
        }
        // Backup names find their extension at the first '.' followed by a letter.
        if !ext.is_empty() && !ext[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(CoreError::invalid_config(format!(
                "extension {ext:?} must start with a letter after the dot"
            )));
        }

        if !self
            .basebackup_command
            .args
            .iter()
            .any(|arg| arg.contains(LABEL_PLACEHOLDER))
        {
            tracing::debug!(
                command = %self.basebackup_command,
                "basebackup command has no {{label}} placeholder"
            );
        }

        Ok(())
    }
}
