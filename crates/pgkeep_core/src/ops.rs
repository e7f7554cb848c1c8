//! Top-level operations.
//!
//! Every operation takes the immutable [`Config`] and its own backend
//! handle. Single-object transfers either fully succeed or leave nothing at
//! the destination; batch operations report success and failure counts.

use crate::backup::{Backup, BackupSet};
use crate::config::{CommandSpec, Config};
use crate::error::{CoreError, CoreResult};
use crate::pipeline::{Pipeline, Sink, Source};
use crate::wal::{Archive, Wal, WalType};
use chrono::{DateTime, Utc};
use pgkeep_storage::{Category, StorageBackend};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Name accepted by [`restore_basebackup`] for the newest sane backup.
pub const LATEST: &str = "LATEST";

/// Outcome of a batch operation in which every item succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Items that completed.
    pub succeeded: usize,
    /// Items that failed.
    pub failed: usize,
}

/// A stored basebackup produced by [`take_basebackup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasebackupReport {
    /// Logical name, `<cluster>@<timestamp>`.
    pub name: String,
    /// Stored object name.
    pub object: String,
    /// Bytes written after filtering.
    pub bytes: u64,
}

/// Where [`restore_basebackup`] writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// Extract the tar stream into a directory with `tar -x`.
    Directory(PathBuf),
    /// Write the decoded tar stream to a file.
    File(PathBuf),
}

/// Archives one WAL file under its own name plus the filter extension.
///
/// # Errors
///
/// Returns [`CoreError::Parse`] if the file name is not a WAL name, or the
/// transfer error.
pub async fn archive_wal(
    config: &Config,
    backend: &Arc<dyn StorageBackend>,
    path: &Path,
) -> CoreResult<String> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CoreError::parse(format!("{} has no file name", path.display())))?;
    let wal = Wal::parse(file_name)?;
    if !wal.sane_name() {
        return Err(CoreError::parse(format!("{file_name} is not a sane WAL name")));
    }

    let object = config.filters.object_name(file_name);
    let outcome = Pipeline::outbound(&config.filters)
        .execute(
            Source::File(path.to_path_buf()),
            Sink::Storage {
                backend: Arc::clone(backend),
                name: object.clone(),
                category: Category::Wal,
            },
        )
        .await?;
    info!(wal = %file_name, object = %object, bytes = outcome.bytes, "archived WAL");
    Ok(object)
}

/// Archives several WAL files concurrently, one task per file.
///
/// # Errors
///
/// Returns [`CoreError::BatchFailed`] with both counts if any file failed.
pub async fn archive_wals(
    config: &Config,
    backend: &Arc<dyn StorageBackend>,
    paths: Vec<PathBuf>,
) -> CoreResult<BatchReport> {
    let mut tasks = JoinSet::new();
    for path in paths {
        let config = config.clone();
        let backend = Arc::clone(backend);
        tasks.spawn(async move {
            let result = archive_wal(&config, &backend, &path).await;
            (path, result)
        });
    }

    let mut report = BatchReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(_))) => report.succeeded += 1,
            Ok((path, Err(err))) => {
                warn!(wal = %path.display(), error = %err, "failed to archive WAL");
                report.failed += 1;
            }
            Err(err) => {
                warn!(error = %err, "archive task failed");
                report.failed += 1;
            }
        }
    }

    info!(succeeded = report.succeeded, failed = report.failed, "WAL batch finished");
    if report.failed > 0 {
        return Err(CoreError::BatchFailed {
            succeeded: report.succeeded,
            failed: report.failed,
        });
    }
    Ok(report)
}

/// Streams a new basebackup into storage.
///
/// Runs the configured basebackup command with `{label}` replaced by the
/// backup name and pushes its stdout through the outbound filters.
///
/// # Errors
///
/// Returns the transfer error; no object is published in that case.
pub async fn take_basebackup(
    config: &Config,
    backend: &Arc<dyn StorageBackend>,
    started: DateTime<Utc>,
) -> CoreResult<BasebackupReport> {
    let name = Backup::name_for(&config.cluster_name, started);
    let object = config.filters.object_name(&name);
    let command = config.basebackup_command.with_label(&name);
    info!(backup = %name, command = %command, "starting basebackup");

    let outcome = Pipeline::outbound(&config.filters)
        .execute(
            Source::Command(command),
            Sink::Storage {
                backend: Arc::clone(backend),
                name: object.clone(),
                category: Category::Basebackup,
            },
        )
        .await?;
    info!(backup = %name, bytes = outcome.bytes, "basebackup stored");

    Ok(BasebackupReport {
        name,
        object,
        bytes: outcome.bytes,
    })
}

/// Restores a basebackup by name, or the newest sane one for [`LATEST`].
///
/// # Errors
///
/// Returns [`CoreError::NotFound`] for unknown names, or the transfer error.
pub async fn restore_basebackup(
    config: &Config,
    backend: &Arc<dyn StorageBackend>,
    name: &str,
    target: RestoreTarget,
) -> CoreResult<Backup> {
    let backups = BackupSet::load(backend.as_ref()).await?;
    let backup = if name == LATEST {
        backups.sane().newest().cloned()
    } else {
        backups.find(name).cloned()
    }
    .ok_or_else(|| CoreError::not_found(format!("basebackup {name}")))?;

    if !backup.is_sane() {
        warn!(backup = %backup, size = backup.size(), "restoring a backup that is not sane");
    }

    let sink = match &target {
        RestoreTarget::Directory(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            let dir = dir.to_string_lossy().into_owned();
            Sink::Command(CommandSpec::new("tar", ["-x", "-f", "-", "-C", dir.as_str()]))
        }
        RestoreTarget::File(path) => Sink::File(path.clone()),
    };

    let outcome = Pipeline::inbound(&config.filters)
        .execute(
            Source::Storage {
                backend: Arc::clone(backend),
                name: backup.object_name(),
                category: Category::Basebackup,
            },
            sink,
        )
        .await?;
    info!(backup = %backup, bytes = outcome.bytes, ?target, "basebackup restored");
    Ok(backup)
}

/// Restores one archived WAL file to `destination`.
///
/// `name` is the logical name the server asks for, e.g.
/// `000000010000000000000003` or `00000002.history`.
///
/// # Errors
///
/// Returns an error if the object does not exist or the transfer fails.
pub async fn fetch_wal(
    config: &Config,
    backend: &Arc<dyn StorageBackend>,
    name: &str,
    destination: &Path,
) -> CoreResult<u64> {
    let wal = Wal::parse(name)?;
    let object = config.filters.object_name(&wal.to_string());
    let outcome = Pipeline::inbound(&config.filters)
        .execute(
            Source::Storage {
                backend: Arc::clone(backend),
                name: object.clone(),
                category: Category::Wal,
            },
            Sink::File(destination.to_path_buf()),
        )
        .await?;
    debug!(
        object = %object,
        destination = %destination.display(),
        bytes = outcome.bytes,
        "fetched WAL"
    );
    Ok(outcome.bytes)
}

/// One basebackup in an [`Inventory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    /// Logical name.
    pub name: String,
    /// Stored object name.
    pub object: String,
    /// Stored size.
    pub size: u64,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Whether retention would consider it.
    pub sane: bool,
}

/// WAL archive counts in an [`Inventory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalSummary {
    /// Regular segments.
    pub segments: usize,
    /// Backup labels.
    pub labels: usize,
    /// Timeline history files.
    pub histories: usize,
    /// Files failing the sanity checks.
    pub insane: usize,
    /// Oldest regular segment.
    pub oldest: Option<String>,
    /// Newest regular segment.
    pub newest: Option<String>,
}

/// What a storage location currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    /// Backups, newest first.
    pub backups: Vec<BackupSummary>,
    /// WAL archive summary.
    pub wal: WalSummary,
}

/// Lists backups and summarizes the WAL archive.
///
/// # Errors
///
/// Returns listing errors from the backend.
pub async fn list(backend: &dyn StorageBackend) -> CoreResult<Inventory> {
    let backups = BackupSet::load(backend).await?;
    let archive = Archive::load(backend).await?;

    let mut wal = WalSummary {
        insane: archive.iter().filter(|w| !w.is_sane()).count(),
        oldest: archive.first_segment().map(|w| w.name().to_string()),
        newest: archive.last_segment().map(|w| w.name().to_string()),
        ..WalSummary::default()
    };
    for file in &archive {
        match file.wal_type() {
            WalType::Regular => wal.segments += 1,
            WalType::BackupLabel => wal.labels += 1,
            WalType::History => wal.histories += 1,
        }
    }

    Ok(Inventory {
        backups: backups
            .iter()
            .map(|b| BackupSummary {
                name: b.name().to_string(),
                object: b.object_name(),
                size: b.size(),
                created: b.created(),
                sane: b.is_sane(),
            })
            .collect(),
        wal,
    })
}
