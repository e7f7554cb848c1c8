//! The ordered collection of archived WAL files.

use super::segment::{Wal, WalType};
use crate::error::CoreResult;
use crate::label::MAX_LABEL_SIZE;
use pgkeep_storage::{Category, ObjectInfo, StorageBackend};
use tracing::debug;

/// All WAL files of one storage location, in name order.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    wals: Vec<Wal>,
}

impl Archive {
    /// Builds an archive from listed objects.
    ///
    /// Objects whose names are not WAL names are skipped.
    #[must_use]
    pub fn from_objects(objects: &[ObjectInfo]) -> Self {
        let wals = objects
            .iter()
            .filter_map(|object| match Wal::from_object(object) {
                Ok(wal) => Some(wal),
                Err(err) => {
                    debug!(object = %object.name, error = %err, "skipping non-WAL object");
                    None
                }
            })
            .collect();
        Self::from_wals(wals)
    }

    /// Builds an archive from already parsed files.
    #[must_use]
    pub fn from_wals(mut wals: Vec<Wal>) -> Self {
        wals.sort_by(Wal::cmp_names);
        Self { wals }
    }

    /// Lists the `wal` category of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn load(backend: &dyn StorageBackend) -> CoreResult<Self> {
        let objects = backend.list(Category::Wal).await?;
        Ok(Self::from_objects(&objects))
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.wals.len()
    }

    /// Returns true if the archive holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wals.is_empty()
    }

    /// Iterates in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Wal> {
        self.wals.iter()
    }

    /// Files passing [`Wal::is_sane`].
    pub fn sane(&self) -> impl Iterator<Item = &Wal> {
        self.wals.iter().filter(|wal| wal.is_sane())
    }

    /// Backup labels small enough to be fetched and parsed.
    pub fn label_candidates(&self) -> impl Iterator<Item = &Wal> {
        self.wals.iter().filter(|wal| {
            wal.wal_type() == WalType::BackupLabel && wal.size() <= MAX_LABEL_SIZE as u64
        })
    }

    /// Files that may be removed once `threshold` is the oldest needed segment.
    ///
    /// History files are never candidates.
    pub fn older_than<'a>(&'a self, threshold: &'a str) -> impl Iterator<Item = &'a Wal> + 'a {
        self.wals
            .iter()
            .filter(move |wal| wal.wal_type() != WalType::History && wal.name() < threshold)
    }

    /// Oldest regular segment.
    #[must_use]
    pub fn first_segment(&self) -> Option<&Wal> {
        self.wals
            .iter()
            .find(|wal| wal.wal_type() == WalType::Regular)
    }

    /// Newest regular segment.
    #[must_use]
    pub fn last_segment(&self) -> Option<&Wal> {
        self.wals
            .iter()
            .rev()
            .find(|wal| wal.wal_type() == WalType::Regular)
    }
}

impl<'a> IntoIterator for &'a Archive {
    type Item = &'a Wal;
    type IntoIter = std::slice::Iter<'a, Wal>;

    fn into_iter(self) -> Self::IntoIter {
        self.wals.iter()
    }
}
