//! End-to-end retention tests against seeded stores.

#![cfg(unix)]

use pgkeep_core::retention::cleanup;
use pgkeep_core::{CoreError, FilterConfig};
use pgkeep_storage::{BackendKind, Category};
use pgkeep_testkit::prelude::*;
use std::num::NonZeroUsize;

fn retain(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// Five daily backups, backup `d` starting in segment `2d`, segments 1..=12.
fn seed_five(store: &SeededStore) -> Vec<String> {
    for counter in 1..=12 {
        store.add_segment(&segment_name(1, counter));
    }
    store.put("00000001.history", Category::Wal, b"1\t0/0\tno recovery target\n".to_vec());
    (1..=5)
        .map(|day| store.add_backup(day, &segment_name(1, 2 * u64::from(day)), BACKUP_SIZE))
        .collect()
}

fn stores() -> Vec<SeededStore> {
    vec![
        SeededStore::memory_with_kind(BackendKind::ObjectStore),
        SeededStore::memory_with_kind(BackendKind::Filesystem),
        SeededStore::filesystem(),
    ]
}

#[tokio::test]
async fn scenario_a_keeps_two_newest_and_prunes_wal() {
    for store in stores() {
        let backups = seed_five(&store);
        let config = store.config().retain(retain(2));

        let report = cleanup(&config, &store.backend(), false).await.unwrap();

        assert_eq!(report.kept, vec![backups[4].clone(), backups[3].clone()]);
        assert_eq!(report.backups_deleted, 3);
        assert_eq!(report.oldest_required_wal, segment_name(1, 8));
        assert_eq!(
            store.names(Category::Basebackup),
            vec![backups[3].clone(), backups[4].clone()]
        );

        let threshold = segment_name(1, 8);
        let wal = store.names(Category::Wal);
        assert!(wal.contains(&"00000001.history".to_string()));
        assert!(wal.contains(&label_object_name(&threshold)));
        for name in &wal {
            if name.ends_with(".history") {
                continue;
            }
            assert!(name[..24] >= *threshold, "{name} should have been deleted");
        }
        // Segments 1..=7 plus the labels of backups 1, 2 and 3.
        assert_eq!(report.wals_deleted(), 10);
    }
}

#[tokio::test]
async fn scenario_b_small_newest_backup_is_never_kept() {
    let store = SeededStore::memory();
    for counter in 1..=8 {
        store.add_segment(&segment_name(1, counter));
    }
    let day1 = store.add_backup(1, &segment_name(1, 2), BACKUP_SIZE);
    let day2 = store.add_backup(2, &segment_name(1, 4), BACKUP_SIZE);
    let day3 = store.add_backup(3, &segment_name(1, 6), BACKUP_SIZE);
    let day4 = store.add_backup(4, &segment_name(1, 8), SMALL_BACKUP_SIZE);

    let config = store.config().retain(retain(2));
    let report = cleanup(&config, &store.backend(), false).await.unwrap();

    assert_eq!(report.kept, vec![day3.clone(), day2.clone()]);
    assert_eq!(report.discarded, vec![day1]);
    assert_eq!(report.oldest_required_wal, segment_name(1, 4));
    // The insane backup is newer than everything kept and is left alone.
    assert_eq!(store.names(Category::Basebackup), vec![day2, day3, day4]);
}

#[tokio::test]
async fn insane_backups_older_than_kept_are_discarded() {
    let store = SeededStore::memory();
    let broken = store.add_backup(1, &segment_name(1, 1), SMALL_BACKUP_SIZE);
    store.add_backup(2, &segment_name(1, 2), BACKUP_SIZE);
    store.add_backup(3, &segment_name(1, 3), BACKUP_SIZE);

    let report = cleanup(&store.config().retain(retain(2)), &store.backend(), false)
        .await
        .unwrap();
    assert_eq!(report.discarded, vec![broken.clone()]);
    assert!(!store.names(Category::Basebackup).contains(&broken));
}

#[tokio::test]
async fn under_quota_deletes_nothing() {
    let store = SeededStore::memory();
    let backups = seed_five(&store);
    let wal_before = store.names(Category::Wal);

    let err = cleanup(&store.config().retain(retain(6)), &store.backend(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InsufficientBackups { have: 5, want: 6 }));

    let mut sorted = backups;
    sorted.sort();
    assert_eq!(store.names(Category::Basebackup), sorted);
    assert_eq!(store.names(Category::Wal), wal_before);
}

#[tokio::test]
async fn failed_backup_delete_keeps_its_wal() {
    let store = SeededStore::memory();
    let backups = seed_five(&store);
    store
        .memory_backend()
        .unwrap()
        .fail_deletes_of(&backups[0]);

    let report = cleanup(&store.config().retain(retain(2)), &store.backend(), false)
        .await
        .unwrap();
    assert_eq!(report.backups_deleted, 2);
    // The surviving oldest backup still needs segment 2.
    assert_eq!(report.oldest_required_wal, segment_name(1, 2));
    assert!(store.names(Category::Wal).contains(&segment_name(1, 2)));
    assert!(!store.names(Category::Wal).contains(&segment_name(1, 1)));
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let store = SeededStore::memory();
    seed_five(&store);
    let basebackups = store.names(Category::Basebackup);
    let wal = store.names(Category::Wal);

    let report = cleanup(&store.config().retain(retain(2)), &store.backend(), true)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.discarded.len(), 3);
    assert_eq!(report.backups_deleted, 0);
    assert_eq!(report.archives[0].candidates, 10);
    assert_eq!(report.wals_deleted(), 0);
    assert_eq!(store.names(Category::Basebackup), basebackups);
    assert_eq!(store.names(Category::Wal), wal);
}

#[tokio::test]
async fn extra_archive_directories_are_pruned() {
    let store = SeededStore::filesystem();
    seed_five(&store);
    let mirror = SeededStore::filesystem();
    for counter in 1..=12 {
        mirror.add_segment(&segment_name(1, counter));
    }

    let config = store
        .config()
        .retain(retain(2))
        .wal_archive_dir(mirror.root().unwrap());
    let report = cleanup(&config, &store.backend(), false).await.unwrap();

    assert_eq!(report.archives.len(), 2);
    assert_eq!(report.archives[1].deleted, 7);
    let remaining = mirror.names(Category::Wal);
    assert_eq!(remaining.first(), Some(&segment_name(1, 8)));
}

#[tokio::test]
async fn extra_archive_without_wal_subdirectory_is_left_alone() {
    let store = SeededStore::filesystem();
    seed_five(&store);
    let flat = tempfile::tempdir().unwrap();
    let segment = flat.path().join(segment_name(1, 1));
    std::fs::write(&segment, b"segment").unwrap();

    let config = store
        .config()
        .retain(retain(2))
        .wal_archive_dir(flat.path());
    let report = cleanup(&config, &store.backend(), false).await.unwrap();

    assert_eq!(report.archives.len(), 2);
    assert_eq!(report.archives[1].candidates, 0);
    assert_eq!(report.archives[1].deleted, 0);
    assert!(segment.exists());
}

#[tokio::test]
async fn missing_label_is_reported() {
    let store = SeededStore::memory();
    for day in 1..=3 {
        store.put(&backup_name(day), Category::Basebackup, vec![0u8; BACKUP_SIZE]);
    }
    let err = cleanup(&store.config().retain(retain(2)), &store.backend(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn unreadable_labels_are_skipped() {
    let store = SeededStore::memory();
    seed_five(&store);
    // A label that only decodes with a different filter.
    store.put(
        &label_object_name(&segment_name(1, 9)),
        Category::Wal,
        b"\x28\xb5\x2f\xfd garbage".to_vec(),
    );
    let mut config = store.config().retain(retain(2));
    config.filters = FilterConfig {
        decompress: failing_command(1),
        ..identity_filters()
    };

    // The decompressor's exit is tolerated, so its empty output just fails to match.
    let err = cleanup(&config, &store.backend(), true).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}
