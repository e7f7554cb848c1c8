//! Backup label parsing.
//!
//! A backup label is the small text file the server archives next to the
//! WAL when a basebackup starts:
//!
//! ```text
//! START WAL LOCATION: 0/3000028 (file 000000010000000000000003)
//! CHECKPOINT LOCATION: 0/3000060
//! BACKUP METHOD: streamed
//! START TIME: 2024-05-01 10:00:00 UTC
//! LABEL: main@2024-05-01T10:00:00Z
//! ```
//!
//! The segment named in `START WAL LOCATION` is the oldest WAL the backup
//! needs to become consistent.

use crate::backup::Backup;
use crate::config::FilterConfig;
use crate::error::{CoreError, CoreResult};
use crate::pipeline::{Pipeline, Sink, Source};
use crate::wal::{Archive, SEGMENT_NAME_LEN};
use pgkeep_storage::{Category, StorageBackend};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest label accepted, both stored and decoded.
pub const MAX_LABEL_SIZE: usize = 4096;

const START_WAL_PREFIX: &str = "START WAL LOCATION:";
const LABEL_PREFIX: &str = "LABEL:";
const FILE_MARKER: &str = "(file ";

/// Extracts the start segment from label text.
///
/// # Errors
///
/// Returns [`CoreError::Parse`] if the input exceeds [`MAX_LABEL_SIZE`] or
/// has no well-formed `START WAL LOCATION` line.
///
/// ```rust
/// let label = b"START WAL LOCATION: 0/3000028 (file 000000010000000000000003)\n";
/// assert_eq!(
///     pgkeep_core::label::parse_start_wal_location(label).unwrap(),
///     "000000010000000000000003"
/// );
/// ```
pub fn parse_start_wal_location(label: &[u8]) -> CoreResult<String> {
    if label.len() > MAX_LABEL_SIZE {
        return Err(CoreError::parse(format!(
            "backup label is {} bytes, larger than {MAX_LABEL_SIZE}",
            label.len()
        )));
    }

    let text = String::from_utf8_lossy(label);
    let line = text
        .lines()
        .find_map(|line| line.trim().strip_prefix(START_WAL_PREFIX))
        .ok_or_else(|| CoreError::parse("backup label has no START WAL LOCATION line"))?;

    let token = line
        .split_once(FILE_MARKER)
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(token, _)| token.trim())
        .ok_or_else(|| CoreError::parse(format!("malformed START WAL LOCATION:{line}")))?;

    if token.len() != SEGMENT_NAME_LEN || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::parse(format!(
            "START WAL LOCATION names {token:?}, not a segment"
        )));
    }
    Ok(token.to_string())
}

/// Returns true if the label's `LABEL:` line names `backup_name`.
#[must_use]
pub fn names_backup(label: &[u8], backup_name: &str) -> bool {
    String::from_utf8_lossy(label).lines().any(|line| {
        line.trim()
            .strip_prefix(LABEL_PREFIX)
            .is_some_and(|name| name.trim() == backup_name)
    })
}

/// Finds the oldest WAL segment `backup` needs.
///
/// Fetches every small backup label in `archive` through the inbound
/// filters until one names the backup. Fetch and parse failures of single
/// labels are logged and skipped. On success the backup's
/// `start_wal_location` and `label_file` are filled in.
///
/// # Errors
///
/// Returns [`CoreError::NotFound`] if no label names the backup.
pub async fn compute_oldest_required_wal(
    backend: &Arc<dyn StorageBackend>,
    archive: &Archive,
    backup: &mut Backup,
    filters: &FilterConfig,
) -> CoreResult<String> {
    let pipeline = Pipeline::inbound(filters);

    for candidate in archive.label_candidates() {
        let object = candidate.object_name();
        let source = Source::Storage {
            backend: Arc::clone(backend),
            name: object.clone(),
            category: Category::Wal,
        };
        let data = match pipeline.execute(source, Sink::Memory).await {
            Ok(outcome) => outcome.data.unwrap_or_default(),
            Err(err) => {
                warn!(label = %object, error = %err, "skipping unreadable backup label");
                continue;
            }
        };

        if !names_backup(&data, backup.name()) {
            debug!(label = %object, backup = %backup.name(), "label names another backup");
            continue;
        }
        match parse_start_wal_location(&data) {
            Ok(start) => {
                info!(
                    backup = %backup.name(),
                    label = %object,
                    start_wal = %start,
                    "found backup label"
                );
                backup.start_wal_location = Some(start.clone());
                backup.label_file = Some(object);
                return Ok(start);
            }
            Err(err) => warn!(label = %object, error = %err, "skipping malformed backup label"),
        }
    }

    Err(CoreError::not_found(format!(
        "backup label for {}",
        backup.name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABEL: &[u8] = b"START WAL LOCATION: 0/3000028 (file 000000010000000000000003)\n\
CHECKPOINT LOCATION: 0/3000060\n\
BACKUP METHOD: streamed\n\
BACKUP FROM: primary\n\
START TIME: 2024-05-01 10:00:00 UTC\n\
LABEL: main@2024-05-01T10:00:00Z\n\
START TIMELINE: 1\n";

    #[test]
    fn parses_start_segment() {
        assert_eq!(
            parse_start_wal_location(LABEL).unwrap(),
            "000000010000000000000003"
        );
    }

    #[test]
    fn rejects_missing_or_malformed_line() {
        assert!(parse_start_wal_location(b"LABEL: x\n").unwrap_err().is_parse());
        assert!(
            parse_start_wal_location(b"START WAL LOCATION: 0/3000028\n")
                .unwrap_err()
                .is_parse()
        );
        assert!(
            parse_start_wal_location(b"START WAL LOCATION: 0/1 (file 0001)\n")
                .unwrap_err()
                .is_parse()
        );
        assert!(parse_start_wal_location(b"").unwrap_err().is_parse());
    }

    #[test]
    fn rejects_oversized_input() {
        let mut big = LABEL.to_vec();
        big.resize(MAX_LABEL_SIZE + 1, b' ');
        assert!(parse_start_wal_location(&big).unwrap_err().is_parse());
    }

    #[test]
    fn label_line_matching() {
        assert!(names_backup(LABEL, "main@2024-05-01T10:00:00Z"));
        assert!(!names_backup(LABEL, "main@2024-05-01T10:00:00"));
        assert!(!names_backup(LABEL, "other@2024-05-01T10:00:00Z"));
    }

    #[cfg(unix)]
    mod fetch {
        use super::*;
        use crate::config::CommandSpec;
        use pgkeep_storage::InMemoryBackend;

        fn identity() -> FilterConfig {
            let cat = CommandSpec::new("cat", Vec::<String>::new());
            FilterConfig::default().compression(cat.clone(), cat, "")
        }

        fn label_for(backup: &str, segment: &str) -> Vec<u8> {
            format!("START WAL LOCATION: 0/1000028 (file {segment})\nLABEL: {backup}\n")
                .into_bytes()
        }

        #[tokio::test]
        async fn finds_matching_label_and_fills_backup() {
            let memory = InMemoryBackend::new();
            memory.insert(
                "000000010000000000000002.00000028.backup",
                Category::Wal,
                label_for("main@2024-01-01T00:00:00Z", "000000010000000000000002"),
            );
            memory.insert(
                "000000010000000000000005.00000028.backup",
                Category::Wal,
                label_for("main@2024-01-02T00:00:00Z", "000000010000000000000005"),
            );
            memory.insert("000000010000000000000005", Category::Wal, vec![0u8; 64]);
            let backend: Arc<dyn StorageBackend> = Arc::new(memory);

            let archive = Archive::load(backend.as_ref()).await.unwrap();
            let mut backup = Backup::parse("main@2024-01-02T00:00:00Z").unwrap();
            let start = compute_oldest_required_wal(&backend, &archive, &mut backup, &identity())
                .await
                .unwrap();

            assert_eq!(start, "000000010000000000000005");
            assert_eq!(backup.start_wal_location.as_deref(), Some(start.as_str()));
            assert_eq!(
                backup.label_file.as_deref(),
                Some("000000010000000000000005.00000028.backup")
            );
        }

        #[tokio::test]
        async fn skips_malformed_labels_and_reports_not_found() {
            let memory = InMemoryBackend::new();
            memory.insert(
                "000000010000000000000002.00000028.backup",
                Category::Wal,
                b"LABEL: main@2024-01-01T00:00:00Z\n".to_vec(),
            );
            let backend: Arc<dyn StorageBackend> = Arc::new(memory);

            let archive = Archive::load(backend.as_ref()).await.unwrap();
            let mut backup = Backup::parse("main@2024-01-01T00:00:00Z").unwrap();
            let err = compute_oldest_required_wal(&backend, &archive, &mut backup, &identity())
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::NotFound { .. }));
            assert!(backup.start_wal_location.is_none());
        }
    }
}
