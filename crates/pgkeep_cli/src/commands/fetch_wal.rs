//! Fetch-wal command implementation.

use super::Backend;
use pgkeep_core::{ops, Config};
use std::path::Path;

/// Runs the fetch-wal command.
///
/// Prints nothing on success; the server only looks at the exit status.
pub async fn run(
    config: &Config,
    backend: &Backend,
    name: &str,
    destination: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    ops::fetch_wal(config, backend, name, destination).await?;
    Ok(())
}
