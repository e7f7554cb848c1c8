//! CLI command implementations.

pub mod archive;
pub mod basebackup;
pub mod cleanup;
pub mod fetch_wal;
pub mod ls;
pub mod restore;

use std::sync::Arc;

/// Backend handle shared by the commands.
pub type Backend = Arc<dyn pgkeep_storage::StorageBackend>;
