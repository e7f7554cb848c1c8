//! Restore command implementation.

use super::Backend;
use pgkeep_core::ops::{self, RestoreTarget};
use pgkeep_core::Config;
use std::path::PathBuf;

/// Runs the restore command.
pub async fn run(
    config: &Config,
    backend: &Backend,
    backup: &str,
    target_dir: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = match (target_dir, output) {
        (Some(dir), None) => RestoreTarget::Directory(dir),
        (None, Some(file)) => RestoreTarget::File(file),
        _ => return Err("exactly one of --target-dir and --output is required".into()),
    };

    let restored = ops::restore_basebackup(config, backend, backup, target).await?;
    println!("Restored basebackup {restored}");
    Ok(())
}
