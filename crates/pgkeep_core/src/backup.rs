//! Basebackups and the set of stored basebackups.
//!
//! ## Naming
//!
//! ```text
//! <cluster>@<RFC 3339 timestamp><ext>
//! main@2024-05-01T10:00:00Z.zst
//! ```
//!
//! The extension starts at the first `.` that is followed by a letter, so
//! fractional seconds (`10:00:00.250Z`) stay part of the timestamp.
//!
//! ## Sanity
//!
//! A backup is *sane* when it is at least [`MIN_BACKUP_SIZE`] bytes and its
//! location is resolvable. Retention only ever keeps sane backups.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use pgkeep_storage::{Category, Location, ObjectInfo, StorageBackend};
use std::fmt;
use tracing::debug;

/// Smallest size a sane basebackup may have.
pub const MIN_BACKUP_SIZE: u64 = 2 * 1024 * 1024;

/// Separator between cluster name and timestamp.
pub const NAME_SEPARATOR: char = '@';

/// A stored basebackup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    name: String,
    extension: String,
    size: u64,
    created: DateTime<Utc>,
    location: Option<Location>,
    /// Oldest WAL segment the backup needs, once its label was read.
    pub start_wal_location: Option<String>,
    /// Object name of the backup label that named this backup.
    pub label_file: Option<String>,
}

impl Backup {
    /// Builds the logical name for a backup of `cluster` taken at `created`.
    #[must_use]
    pub fn name_for(cluster: &str, created: DateTime<Utc>) -> String {
        format!(
            "{cluster}{NAME_SEPARATOR}{}",
            created.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// Parses a stored object name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] if the cluster name is missing or the
    /// timestamp is not RFC 3339.
    pub fn parse(full_name: &str) -> CoreResult<Self> {
        let (cluster, rest) = full_name
            .split_once(NAME_SEPARATOR)
            .ok_or_else(|| CoreError::parse(format!("backup name {full_name:?} has no '@'")))?;
        if cluster.is_empty() {
            return Err(CoreError::parse(format!(
                "backup name {full_name:?} has no cluster name"
            )));
        }

        let ext_start = extension_start(rest);
        let (timestamp, extension) = rest.split_at(ext_start);
        let created = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|err| {
                CoreError::parse(format!("backup name {full_name:?}: bad timestamp: {err}"))
            })?
            .with_timezone(&Utc);

        let name_len = cluster.len() + NAME_SEPARATOR.len_utf8() + timestamp.len();
        Ok(Self {
            name: full_name[..name_len].to_string(),
            extension: extension.to_string(),
            size: 0,
            created,
            location: None,
            start_wal_location: None,
            label_file: None,
        })
    }

    /// Parses a listed object, keeping its size and location.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] if the object name is not a backup name.
    pub fn from_object(object: &ObjectInfo) -> CoreResult<Self> {
        let mut backup = Self::parse(&object.name)?;
        backup.size = object.size;
        backup.location = Some(object.location.clone());
        Ok(backup)
    }

    /// Logical name, `<cluster>@<timestamp>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Everything after the timestamp.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Full stored object name.
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("{}{}", self.name, self.extension)
    }

    /// Cluster component of the name.
    #[must_use]
    pub fn cluster(&self) -> &str {
        self.name
            .split_once(NAME_SEPARATOR)
            .map_or(self.name.as_str(), |(cluster, _)| cluster)
    }

    /// Stored size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Creation time parsed from the name.
    #[must_use]
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Physical location, if the backup came from a listing.
    #[must_use]
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Large enough and resolvable.
    #[must_use]
    pub fn is_sane(&self) -> bool {
        self.size >= MIN_BACKUP_SIZE && self.location.as_ref().is_some_and(Location::is_resolvable)
    }
}

impl fmt::Display for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.extension)
    }
}

/// Index of the first `.` followed by an ASCII letter, or the length.
fn extension_start(s: &str) -> usize {
    let bytes = s.as_bytes();
    bytes
        .windows(2)
        .position(|pair| pair[0] == b'.' && pair[1].is_ascii_alphabetic())
        .unwrap_or(s.len())
}

/// Newest-first ordering by creation time.
fn newest_first(a: &Backup, b: &Backup) -> std::cmp::Ordering {
    b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name))
}

/// All basebackups of one storage location, newest first.
#[derive(Debug, Clone, Default)]
pub struct BackupSet {
    backups: Vec<Backup>,
}

impl BackupSet {
    /// Builds a set from listed objects, skipping names that do not parse.
    #[must_use]
    pub fn from_objects(objects: &[ObjectInfo]) -> Self {
        let backups = objects
            .iter()
            .filter_map(|object| match Backup::from_object(object) {
                Ok(backup) => Some(backup),
                Err(err) => {
                    debug!(object = %object.name, error = %err, "skipping non-backup object");
                    None
                }
            })
            .collect();
        Self::from_backups(backups)
    }

    /// Builds a set from parsed backups.
    #[must_use]
    pub fn from_backups(mut backups: Vec<Backup>) -> Self {
        backups.sort_by(newest_first);
        Self { backups }
    }

    /// Lists the `basebackup` category of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn load(backend: &dyn StorageBackend) -> CoreResult<Self> {
        let objects = backend.list(Category::Basebackup).await?;
        Ok(Self::from_objects(&objects))
    }

    /// Number of backups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backups.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    /// Iterates newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Backup> {
        self.backups.iter()
    }

    /// The sane subset, still newest first.
    #[must_use]
    pub fn sane(&self) -> BackupSet {
        Self {
            backups: self.backups.iter().filter(|b| b.is_sane()).cloned().collect(),
        }
    }

    /// The insane subset.
    #[must_use]
    pub fn insane(&self) -> BackupSet {
        Self {
            backups: self.backups.iter().filter(|b| !b.is_sane()).cloned().collect(),
        }
    }

    /// Most recent backup.
    #[must_use]
    pub fn newest(&self) -> Option<&Backup> {
        self.backups.first()
    }

    /// Oldest backup.
    #[must_use]
    pub fn oldest(&self) -> Option<&Backup> {
        self.backups.last()
    }

    /// Finds a backup by logical or full object name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Backup> {
        self.backups
            .iter()
            .find(|b| b.name == name || b.object_name() == name)
    }

    /// Consumes the set, returning backups newest first.
    #[must_use]
    pub fn into_vec(self) -> Vec<Backup> {
        self.backups
    }
}

impl IntoIterator for BackupSet {
    type Item = Backup;
    type IntoIter = std::vec::IntoIter<Backup>;

    fn into_iter(self) -> Self::IntoIter {
        self.backups.into_iter()
    }
}
