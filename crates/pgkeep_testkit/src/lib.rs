//! # pgkeep Testkit
//!
//! Test utilities for pgkeep.
//!
//! This crate provides:
//! - Fixtures that seed storage with backups, labels and WAL segments
//! - Filter configurations built from `cat` so pipelines run anywhere
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pgkeep_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_seeded_store() {
//!     let store = SeededStore::memory();
//!     store.add_backup(1, "000000010000000000000002", BACKUP_SIZE);
//!     // ... run retention against store.backend()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
