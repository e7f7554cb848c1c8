//! Archive command implementation.

use super::Backend;
use pgkeep_core::{ops, Config};
use std::path::PathBuf;

/// Runs the archive command.
///
/// A single file is archived directly so the server sees its exact error.
pub async fn run(
    config: &Config,
    backend: &Backend,
    mut files: Vec<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    if files.len() == 1 {
        if let Some(file) = files.pop() {
            let object = ops::archive_wal(config, backend, &file).await?;
            println!("{} -> {object}", file.display());
        }
        return Ok(());
    }

    let report = ops::archive_wals(config, backend, files).await?;
    println!("Archived {} WAL files", report.succeeded);
    Ok(())
}
