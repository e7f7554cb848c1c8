//! Basebackup command implementation.

use super::Backend;
use chrono::Utc;
use pgkeep_core::{ops, Config};

/// Runs the basebackup command.
pub async fn run(config: &Config, backend: &Backend) -> Result<(), Box<dyn std::error::Error>> {
    let report = ops::take_basebackup(config, backend, Utc::now()).await?;
    println!(
        "Stored basebackup {} as {} ({} bytes)",
        report.name, report.object, report.bytes
    );
    Ok(())
}
