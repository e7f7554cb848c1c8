//! # pgkeep Core
//!
//! Lifecycle management for PostgreSQL basebackups and archived WAL.
//!
//! This crate provides:
//! - The WAL and basebackup naming model ([`Wal`], [`Archive`], [`Backup`], [`BackupSet`])
//! - Backup label parsing to find the oldest WAL a backup needs
//! - The retention engine that deletes expired backups and WAL
//! - Streaming transfers through external compression and encryption filters
//! - Top-level operations: archive, basebackup, restore, fetch, cleanup, list
//!
//! Storage is reached through [`pgkeep_storage::StorageBackend`]; every
//! operation takes a typed [`Config`] and reads no global state.
//!
//! ## Example
//!
//! ```no_run
//! use pgkeep_core::{ops, Config, StorageConfig};
//!
//! # async fn demo() -> pgkeep_core::CoreResult<()> {
//! let config = Config::new().storage(StorageConfig::filesystem("/var/lib/pgkeep"));
//! config.validate()?;
//! let backend = config.storage.open()?;
//!
//! ops::archive_wal(&config, &backend, "pg_wal/000000010000000000000001".as_ref()).await?;
//! let report = pgkeep_core::retention::cleanup(&config, &backend, false).await?;
//! println!("deleted {} backups", report.backups_deleted);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod config;
mod error;
pub mod label;
pub mod ops;
pub mod pipeline;
pub mod retention;
mod wal;

pub use backup::{Backup, BackupSet, MIN_BACKUP_SIZE};
pub use config::{CommandSpec, Config, FilterConfig, StorageConfig, LABEL_PLACEHOLDER};
pub use error::{CoreError, CoreResult};
pub use retention::{AgePartition, CleanupReport, InsufficientBackups};
pub use wal::{Archive, Wal, WalType, MAX_SEGMENT_SIZE};
