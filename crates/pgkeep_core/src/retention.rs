//! Retention: which backups to keep and what may be deleted.
//!
//! ## Cleanup flow
//!
//! ```text
//! list backups ─► sane subset ─► separate_by_age(retain)
//!                                   │ keep          │ discard (+ old insane)
//!                                   ▼               ▼
//!                                              delete_all_backups
//! relist backups ─► oldest sane ─► compute_oldest_required_wal
//!                                   ▼
//!                          delete_older_than (per archive)
//! ```
//!
//! Backups are deleted before WAL, and the WAL threshold is derived from a
//! fresh listing. A backup whose deletion failed is therefore still the
//! oldest one and keeps its WAL alive.

use crate::backup::{Backup, BackupSet};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::label::compute_oldest_required_wal;
use crate::wal::{Archive, Wal};
use pgkeep_storage::{BackendKind, Category, FileBackend, StorageBackend};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Backups split by age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgePartition {
    /// The newest backups, newest first. Never empty.
    pub keep: Vec<Backup>,
    /// Everything older, newest first.
    pub discard: Vec<Backup>,
}

impl AgePartition {
    /// Oldest backup that is kept.
    #[must_use]
    pub fn oldest_kept(&self) -> Option<&Backup> {
        self.keep.last()
    }
}

/// Fewer backups exist than the quota asks to keep.
///
/// Carries the untouched backups back to the caller.
#[derive(Debug, Clone, Error)]
#[error("have {} backups, retention requires {required}", .backups.len())]
pub struct InsufficientBackups {
    /// The backups that were passed in, newest first.
    pub backups: Vec<Backup>,
    /// The retention quota.
    pub required: NonZeroUsize,
}

impl From<InsufficientBackups> for CoreError {
    fn from(err: InsufficientBackups) -> Self {
        CoreError::InsufficientBackups {
            have: err.backups.len(),
            want: err.required.get(),
        }
    }
}

/// Keeps the `keep` newest backups and discards the rest.
///
/// # Errors
///
/// Returns [`InsufficientBackups`] with the sorted input if there are fewer
/// than `keep` backups. Nothing is discarded in that case.
pub fn separate_by_age(
    mut backups: Vec<Backup>,
    keep: NonZeroUsize,
) -> Result<AgePartition, InsufficientBackups> {
    backups.sort_by(|a, b| b.created().cmp(&a.created()));
    if backups.len() < keep.get() {
        return Err(InsufficientBackups {
            backups,
            required: keep,
        });
    }
    let discard = backups.split_off(keep.get());
    Ok(AgePartition {
        keep: backups,
        discard,
    })
}

/// Deletes `discard`, oldest first.
///
/// Failures are logged and skipped. Returns the number deleted.
pub async fn delete_all_backups(backend: &dyn StorageBackend, mut discard: Vec<Backup>) -> usize {
    discard.sort_by_key(Backup::created);
    let mut deleted = 0;
    for backup in discard {
        let object = backup.object_name();
        match backend.delete(&object, Category::Basebackup).await {
            Ok(()) => {
                info!(backup = %object, "deleted basebackup");
                deleted += 1;
            }
            Err(err) => warn!(backup = %object, error = %err, "failed to delete basebackup"),
        }
    }
    deleted
}

/// Deletes every file in `archive` whose name sorts before `threshold`.
///
/// History files are kept. A filesystem backend is pruned sequentially;
/// an object store is pruned by up to `parallelism` concurrent deletes.
/// Failures are logged and skipped. Returns the number deleted.
pub async fn delete_older_than(
    backend: &Arc<dyn StorageBackend>,
    archive: &Archive,
    threshold: &str,
    parallelism: NonZeroUsize,
) -> usize {
    let doomed: Vec<String> = archive.older_than(threshold).map(Wal::object_name).collect();
    debug!(threshold, candidates = doomed.len(), kind = %backend.kind(), "pruning WAL");

    match backend.kind() {
        BackendKind::Filesystem => {
            let mut deleted = 0;
            for name in doomed {
                match backend.delete(&name, Category::Wal).await {
                    Ok(()) => {
                        debug!(wal = %name, "deleted WAL");
                        deleted += 1;
                    }
                    Err(err) => warn!(wal = %name, error = %err, "failed to delete WAL"),
                }
            }
            deleted
        }
        BackendKind::ObjectStore => {
            let permits = Arc::new(Semaphore::new(parallelism.get()));
            let mut tasks = JoinSet::new();
            for name in doomed {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let backend = Arc::clone(backend);
                tasks.spawn(async move {
                    let _permit = permit;
                    let result = backend.delete(&name, Category::Wal).await;
                    (name, result)
                });
            }

            let mut deleted = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => {
                        debug!(wal = %name, "deleted WAL");
                        deleted += 1;
                    }
                    Ok((name, Err(err))) => {
                        warn!(wal = %name, error = %err, "failed to delete WAL");
                    }
                    Err(err) => warn!(error = %err, "WAL delete task failed"),
                }
            }
            deleted
        }
    }
}

/// WAL pruning result for one archive location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    /// `primary` or the extra archive directory.
    pub location: String,
    /// Files older than the threshold.
    pub candidates: usize,
    /// Files actually deleted.
    pub deleted: usize,
}

/// Outcome of [`cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Whether anything was deleted.
    pub dry_run: bool,
    /// Kept backups, newest first.
    pub kept: Vec<String>,
    /// Backups selected for deletion.
    pub discarded: Vec<String>,
    /// Backups actually deleted.
    pub backups_deleted: usize,
    /// WAL threshold; every older file was eligible for deletion.
    pub oldest_required_wal: String,
    /// Per archive WAL results.
    pub archives: Vec<ArchiveReport>,
}

impl CleanupReport {
    /// Total WAL files deleted across all archives.
    #[must_use]
    pub fn wals_deleted(&self) -> usize {
        self.archives.iter().map(|a| a.deleted).sum()
    }
}

/// Applies the retention policy of `config` to `backend`.
///
/// With `dry_run` set, computes and reports the same selection without
/// deleting anything.
///
/// # Errors
///
/// - [`CoreError::InsufficientBackups`] if fewer sane backups exist than
///   the quota; nothing is deleted
/// - [`CoreError::NoSaneBackups`] if no sane backup remains after deletion
/// - [`CoreError::NotFound`] if the oldest kept backup has no label
/// - Listing errors from the backend
pub async fn cleanup(
    config: &Config,
    backend: &Arc<dyn StorageBackend>,
    dry_run: bool,
) -> CoreResult<CleanupReport> {
    let all = BackupSet::load(backend.as_ref()).await?;
    let partition = separate_by_age(all.sane().into_vec(), config.retain)?;
    let Some(oldest_kept) = partition.oldest_kept().cloned() else {
        return Err(CoreError::NoSaneBackups);
    };

    let mut discard = partition.discard.clone();
    discard.extend(
        all.insane()
            .into_iter()
            .filter(|backup| backup.created() < oldest_kept.created()),
    );

    let mut report = CleanupReport {
        dry_run,
        kept: partition.keep.iter().map(Backup::object_name).collect(),
        discarded: discard.iter().map(Backup::object_name).collect(),
        ..CleanupReport::default()
    };
    info!(
        kept = report.kept.len(),
        discard = report.discarded.len(),
        dry_run,
        "retention selection"
    );

    let mut oldest = if dry_run {
        oldest_kept
    } else {
        report.backups_deleted = delete_all_backups(backend.as_ref(), discard).await;
        BackupSet::load(backend.as_ref())
            .await?
            .sane()
            .oldest()
            .cloned()
            .ok_or(CoreError::NoSaneBackups)?
    };

    let archive = Archive::load(backend.as_ref()).await?;
    let threshold =
        compute_oldest_required_wal(backend, &archive, &mut oldest, &config.filters).await?;
    report.oldest_required_wal = threshold.clone();

    let mut locations: Vec<(String, Arc<dyn StorageBackend>, Archive)> =
        vec![("primary".to_string(), Arc::clone(backend), archive)];
    for dir in &config.wal_archive_dirs {
        let files = FileBackend::new(dir);
        let wal_dir = files.category_dir(Category::Wal);
        if !tokio::fs::try_exists(&wal_dir).await.unwrap_or(false) {
            warn!(
                dir = %dir.display(),
                expected = %wal_dir.display(),
                "extra archive has no WAL directory"
            );
        }
        let extra: Arc<dyn StorageBackend> = Arc::new(files);
        let archive = Archive::load(extra.as_ref()).await?;
        locations.push((dir.display().to_string(), extra, archive));
    }

    for (location, target, archive) in locations {
        let candidates = archive.older_than(&threshold).count();
        let deleted = if dry_run {
            0
        } else {
            delete_older_than(&target, &archive, &threshold, config.delete_parallelism).await
        };
        info!(%location, candidates, deleted, threshold = %threshold, "pruned WAL archive");
        report.archives.push(ArchiveReport {
            location,
            candidates,
            deleted,
        });
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::MIN_BACKUP_SIZE;
    use pgkeep_storage::{InMemoryBackend, Location, ObjectInfo};
    use proptest::prelude::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn backup(day: u32) -> Backup {
        Backup::from_object(&ObjectInfo {
            name: format!("main@2024-01-{day:02}T00:00:00Z.zst"),
            size: MIN_BACKUP_SIZE,
            location: Location::Object {
                bucket: "b".into(),
                key: format!("basebackup/{day}"),
            },
        })
        .unwrap()
    }

    #[test]
    fn separate_keeps_newest() {
        let partition =
            separate_by_age(vec![backup(3), backup(5), backup(1), backup(4)], nz(2)).unwrap();
        let day = |b: &Backup| b.created().format("%d").to_string();
        let keep: Vec<_> = partition.keep.iter().map(day).collect();
        let discard: Vec<_> = partition.discard.iter().map(day).collect();
        assert_eq!(keep, vec!["05", "04"]);
        assert_eq!(discard, vec!["03", "01"]);
        assert_eq!(partition.oldest_kept().unwrap().created(), backup(4).created());
    }

    #[test]
    fn separate_under_quota_returns_backups() {
        let err = separate_by_age(vec![backup(1), backup(2)], nz(3)).unwrap_err();
        assert_eq!(err.backups.len(), 2);
        assert_eq!(err.backups[0].created(), backup(2).created());
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::InsufficientBackups { have: 2, want: 3 }));
    }

    #[test]
    fn separate_exact_quota_discards_nothing() {
        let partition = separate_by_age(vec![backup(1), backup(2)], nz(2)).unwrap();
        assert_eq!(partition.keep.len(), 2);
        assert!(partition.discard.is_empty());
    }

    proptest! {
        #[test]
        fn partition_is_complete_and_ordered(
            days in proptest::collection::btree_set(1u32..=28, 0..20),
            keep in 1usize..10,
        ) {
            let backups: Vec<_> = days.iter().map(|d| backup(*d)).collect();
            let total = backups.len();
            match separate_by_age(backups, nz(keep)) {
                Ok(partition) => {
                    prop_assert_eq!(partition.keep.len(), keep);
                    prop_assert_eq!(partition.keep.len() + partition.discard.len(), total);
                    let newest_discarded = partition.discard.first().map(Backup::created);
                    if let Some(newest_discarded) = newest_discarded {
                        prop_assert!(partition.oldest_kept().unwrap().created() > newest_discarded);
                    }
                }
                Err(err) => {
                    prop_assert!(total < keep);
                    prop_assert_eq!(err.backups.len(), total);
                }
            }
        }
    }

    #[tokio::test]
    async fn delete_all_backups_skips_failures() {
        let backend = InMemoryBackend::new();
        for day in [1, 2, 3] {
            backend.insert(&backup(day).object_name(), Category::Basebackup, vec![0u8; 1]);
        }
        backend.fail_deletes_of(&backup(2).object_name());

        let deleted =
            delete_all_backups(&backend, vec![backup(1), backup(2), backup(3), backup(9)]).await;
        assert_eq!(deleted, 2);
        assert_eq!(backend.names(Category::Basebackup), vec![backup(2).object_name()]);
    }

    async fn prune_with(kind: BackendKind) -> (usize, Vec<String>) {
        let memory = InMemoryBackend::with_kind(kind);
        for name in [
            "000000010000000000000001.zst",
            "000000010000000000000002.zst",
            "000000010000000000000002.00000028.backup.zst",
            "000000010000000000000003.zst",
            "000000010000000000000004.zst",
            "00000001.history.zst",
        ] {
            memory.insert(name, Category::Wal, vec![1u8; 8]);
        }
        memory.fail_deletes_of("000000010000000000000001.zst");
        let backend: Arc<dyn StorageBackend> = Arc::new(memory);

        let archive = Archive::load(backend.as_ref()).await.unwrap();
        let deleted =
            delete_older_than(&backend, &archive, "000000010000000000000003", nz(2)).await;
        let remaining = backend
            .list(Category::Wal)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        (deleted, remaining)
    }

    #[tokio::test]
    async fn delete_older_than_both_strategies_agree() {
        for kind in [BackendKind::Filesystem, BackendKind::ObjectStore] {
            let (deleted, remaining) = prune_with(kind).await;
            assert_eq!(deleted, 2, "{kind}");
            assert_eq!(
                remaining,
                vec![
                    "00000001.history.zst",
                    "000000010000000000000001.zst",
                    "000000010000000000000003.zst",
                    "000000010000000000000004.zst",
                ],
                "{kind}"
            );
        }
    }

    #[tokio::test]
    async fn deleting_already_deleted_wal_is_not_fatal() {
        let memory = InMemoryBackend::with_kind(BackendKind::ObjectStore);
        memory.insert("000000010000000000000001", Category::Wal, vec![1u8; 8]);
        memory.insert("000000010000000000000002", Category::Wal, vec![1u8; 8]);
        let backend: Arc<dyn StorageBackend> = Arc::new(memory);
        let archive = Archive::load(backend.as_ref()).await.unwrap();

        backend
            .delete("000000010000000000000001", Category::Wal)
            .await
            .unwrap();
        let deleted =
            delete_older_than(&backend, &archive, "000000010000000000000009", nz(4)).await;
        assert_eq!(deleted, 1);
        assert!(backend.list(Category::Wal).await.unwrap().is_empty());
    }
}
