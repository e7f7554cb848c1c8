//! Ls command implementation.

use crate::options::OutputFormat;
use pgkeep_core::ops::{self, Inventory};
use pgkeep_storage::StorageBackend;
use std::fmt::Write;

/// Runs the ls command.
pub async fn run(
    backend: &dyn StorageBackend,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let inventory = ops::list(backend).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&inventory)?),
        OutputFormat::Text => print!("{}", render(&inventory)),
    }
    Ok(())
}

fn render(inventory: &Inventory) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Basebackups: {}", inventory.backups.len());
    for backup in &inventory.backups {
        let flag = if backup.sane { "" } else { "  (not sane)" };
        let _ = writeln!(
            out,
            "  {:<40} {:>14} bytes  {}{flag}",
            backup.object,
            backup.size,
            backup.created.to_rfc3339()
        );
    }

    let wal = &inventory.wal;
    let _ = writeln!(
        out,
        "WAL: {} segments, {} labels, {} histories, {} not sane",
        wal.segments, wal.labels, wal.histories, wal.insane
    );
    if let (Some(oldest), Some(newest)) = (&wal.oldest, &wal.newest) {
        let _ = writeln!(out, "  range {oldest} .. {newest}");
    }
    out
}
