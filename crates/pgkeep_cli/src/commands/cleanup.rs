//! Cleanup command implementation.

use super::Backend;
use crate::options::OutputFormat;
use pgkeep_core::{retention, CleanupReport, Config};
use std::fmt::Write;

/// Runs the cleanup command.
pub async fn run(
    config: &Config,
    backend: &Backend,
    dry_run: bool,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = retention::cleanup(config, backend, dry_run).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render(&report)),
    }
    Ok(())
}

fn render(report: &CleanupReport) -> String {
    let mut out = String::new();
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };

    let _ = writeln!(out, "Keeping {} basebackups:", report.kept.len());
    for name in &report.kept {
        let _ = writeln!(out, "  {name}");
    }
    if report.dry_run {
        let _ = writeln!(out, "{verb} {} basebackups:", report.discarded.len());
    } else {
        let _ = writeln!(
            out,
            "{verb} {} of {} basebackups:",
            report.backups_deleted,
            report.discarded.len()
        );
    }
    for name in &report.discarded {
        let _ = writeln!(out, "  {name}");
    }

    let _ = writeln!(out, "Oldest required WAL: {}", report.oldest_required_wal);
    for archive in &report.archives {
        let count = if report.dry_run {
            archive.candidates
        } else {
            archive.deleted
        };
        let _ = writeln!(out, "{verb} {count} WAL files from {}", archive.location);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgkeep_core::retention::ArchiveReport;

    fn report(dry_run: bool) -> CleanupReport {
        CleanupReport {
            dry_run,
            kept: vec!["main@2024-01-05T00:00:00Z".into()],
            discarded: vec!["main@2024-01-04T00:00:00Z".into()],
            backups_deleted: if dry_run { 0 } else { 1 },
            oldest_required_wal: "000000010000000000000008".into(),
            archives: vec![ArchiveReport {
                location: "primary".into(),
                candidates: 7,
                deleted: if dry_run { 0 } else { 6 },
            }],
        }
    }

    #[test]
    fn render_reports_deletions() {
        let text = render(&report(false));
        assert!(text.contains("Keeping 1 basebackups"));
        assert!(text.contains("Deleted 1 of 1 basebackups"));
        assert!(text.contains("Deleted 6 WAL files from primary"));
    }

    #[test]
    fn render_dry_run_reports_candidates() {
        let text = render(&report(true));
        assert!(text.contains("Would delete 1 basebackups"));
        assert!(text.contains("Would delete 7 WAL files from primary"));
    }
}
