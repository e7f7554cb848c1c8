//! WAL object names.

use crate::error::{CoreError, CoreResult};
use pgkeep_storage::{Location, ObjectInfo};
use std::cmp::Ordering;
use std::fmt;

/// Length of a segment name: timeline (8) + counter (16).
pub const SEGMENT_NAME_LEN: usize = 24;

/// Length of the timeline component.
pub const TIMELINE_LEN: usize = 8;

/// Largest size a sane segment may have.
pub const MAX_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

const HISTORY_SUFFIX: &str = ".history";
const BACKUP_SUFFIX: &str = ".backup";

/// The kind of file archived in the `wal` category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalType {
    /// A replayable log segment.
    Regular,
    /// A backup label, `<segment>.<offset>.backup`.
    BackupLabel,
    /// A timeline history file, `<timeline>.history`.
    History,
}

impl fmt::Display for WalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalType::Regular => f.write_str("regular"),
            WalType::BackupLabel => f.write_str("backup label"),
            WalType::History => f.write_str("history"),
        }
    }
}

/// A file in the WAL archive.
///
/// The name is split into the logical `name` and whatever follows it
/// (`extension`). For segments and backup labels the name is the 24
/// character segment name; backup labels keep `.<offset>.backup` in the
/// extension. History files are named `<timeline>.history`.
///
/// - `000000010000000000000003.zst`: name `000000010000000000000003`,
///   extension `.zst`
/// - `000000010000000000000003.00000028.backup.zst`: name
///   `000000010000000000000003`, extension `.00000028.backup.zst`
/// - `00000002.history.zst`: name `00000002.history`, extension `.zst`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wal {
    name: String,
    extension: String,
    size: u64,
    wal_type: WalType,
    location: Option<Location>,
}

impl Wal {
    /// Parses a stored object name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] if the name matches none of the
    /// segment, backup label or history grammars.
    pub fn parse(full_name: &str) -> CoreResult<Self> {
        if let Some((name, extension)) = split_history(full_name) {
            return Ok(Self::from_parts(name, extension, WalType::History));
        }

        let Some(name) = full_name.get(..SEGMENT_NAME_LEN) else {
            return Err(unrecognized(full_name));
        };
        if !is_alnum(name) {
            return Err(unrecognized(full_name));
        }

        let rest = &full_name[SEGMENT_NAME_LEN..];
        if !rest.is_empty() && !rest.starts_with('.') {
            return Err(unrecognized(full_name));
        }
        let wal_type = if is_backup_label_suffix(rest) {
            WalType::BackupLabel
        } else {
            WalType::Regular
        };
        Ok(Self::from_parts(name, rest, wal_type))
    }

    /// Parses a listed object, keeping its size and location.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] if the object name is not a WAL name.
    pub fn from_object(object: &ObjectInfo) -> CoreResult<Self> {
        let mut wal = Self::parse(&object.name)?;
        wal.size = object.size;
        wal.location = Some(object.location.clone());
        Ok(wal)
    }

    fn from_parts(name: &str, extension: &str, wal_type: WalType) -> Self {
        Self {
            name: name.to_string(),
            extension: extension.to_string(),
            size: 0,
            wal_type,
            location: None,
        }
    }

    /// Logical name without extension.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Everything after the logical name.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Stored size in bytes (zero when parsed from a bare name).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// File kind.
    #[must_use]
    pub fn wal_type(&self) -> WalType {
        self.wal_type
    }

    /// Physical location, if the WAL came from a listing.
    #[must_use]
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// Full stored object name (`name` + `extension`).
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("{}{}", self.name, self.extension)
    }

    /// The 8 character timeline.
    #[must_use]
    pub fn timeline(&self) -> &str {
        &self.name[..TIMELINE_LEN]
    }

    /// The 16 character segment counter. `None` for history files.
    #[must_use]
    pub fn counter(&self) -> Option<&str> {
        match self.wal_type {
            WalType::History => None,
            WalType::Regular | WalType::BackupLabel => {
                self.name.get(TIMELINE_LEN..SEGMENT_NAME_LEN)
            }
        }
    }

    /// Checks the name against the grammar of its type.
    #[must_use]
    pub fn sane_name(&self) -> bool {
        match self.wal_type {
            WalType::Regular | WalType::BackupLabel => {
                self.name.len() == SEGMENT_NAME_LEN && is_alnum(&self.name)
            }
            WalType::History => self
                .name
                .strip_suffix(HISTORY_SUFFIX)
                .is_some_and(|timeline| timeline.len() == TIMELINE_LEN && is_alnum(timeline)),
        }
    }

    /// Sane name and, except for backup labels, no larger than a segment.
    #[must_use]
    pub fn is_sane(&self) -> bool {
        self.sane_name() && (self.wal_type == WalType::BackupLabel || self.size <= MAX_SEGMENT_SIZE)
    }

    /// Archive order: plain comparison of the full names.
    #[must_use]
    pub fn older_than(&self, other: &Wal) -> bool {
        self.cmp_names(other) == Ordering::Less
    }

    /// Total order used to sort an [`Archive`](super::Archive).
    #[must_use]
    pub fn cmp_names(&self, other: &Wal) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.extension.cmp(&other.extension))
    }
}

impl fmt::Display for Wal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.extension)
    }
}

fn unrecognized(name: &str) -> CoreError {
    CoreError::parse(format!("unrecognized WAL name {name:?}"))
}

fn is_alnum(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Splits `<8>.history<ext>` into `("<8>.history", "<ext>")`.
fn split_history(full_name: &str) -> Option<(&str, &str)> {
    let timeline = full_name.get(..TIMELINE_LEN)?;
    if !is_alnum(timeline) {
        return None;
    }
    let name_len = TIMELINE_LEN + HISTORY_SUFFIX.len();
    if full_name.get(TIMELINE_LEN..name_len)? != HISTORY_SUFFIX {
        return None;
    }
    let extension = &full_name[name_len..];
    (extension.is_empty() || extension.starts_with('.'))
        .then(|| (&full_name[..name_len], extension))
}

/// Matches `.<8>.backup<ext>`.
fn is_backup_label_suffix(rest: &str) -> bool {
    let Some(offset) = rest.get(1..1 + TIMELINE_LEN) else {
        return false;
    };
    if !rest.starts_with('.') || !is_alnum(offset) {
        return false;
    }
    let tail = &rest[1 + TIMELINE_LEN..];
    tail.strip_prefix(BACKUP_SUFFIX)
        .is_some_and(|ext| ext.is_empty() || ext.starts_with('.'))
}
