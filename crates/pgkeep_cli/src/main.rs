//! pgkeep CLI
//!
//! Command-line tools for PostgreSQL basebackups and WAL archives.
//!
//! # Commands
//!
//! - `archive` - Archive WAL files (use as `archive_command`)
//! - `basebackup` - Stream a new basebackup into storage
//! - `restore` - Restore a basebackup into a directory or tar file
//! - `fetch-wal` - Restore one WAL file (use as `restore_command`)
//! - `cleanup` - Apply the retention policy
//! - `ls` - List backups and summarize the WAL archive

mod commands;
mod options;

use clap::{Parser, Subcommand};
use options::{GlobalOptions, OutputFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Manage PostgreSQL basebackups and archived WAL.
#[derive(Parser)]
#[command(name = "pgkeep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive WAL files
    Archive {
        /// WAL files to archive
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Stream a new basebackup into storage
    Basebackup {
        /// Override the command producing the tar stream ({label} is replaced)
        #[arg(long, value_parser = options::parse_command)]
        command: Option<pgkeep_core::CommandSpec>,
    },

    /// Restore a basebackup
    Restore {
        /// Backup name, or LATEST for the newest sane backup
        #[arg(default_value = pgkeep_core::ops::LATEST)]
        backup: String,

        /// Extract into this directory
        #[arg(long, conflicts_with = "output", required_unless_present = "output")]
        target_dir: Option<PathBuf>,

        /// Write the tar stream to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Restore one WAL file
    FetchWal {
        /// WAL name requested by the server (%f)
        name: String,

        /// Destination path (%p)
        destination: PathBuf,
    },

    /// Delete expired basebackups and the WAL only they needed
    Cleanup {
        /// Number of basebackups to keep
        #[arg(short, long)]
        retain: Option<usize>,

        /// Dry run - show what would be deleted
        #[arg(short, long)]
        dry_run: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List backups and summarize the WAL archive
    Ls {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("pgkeep v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = cli.global.to_config()?;
    if let Commands::Cleanup {
        retain: Some(retain),
        ..
    } = &cli.command
    {
        config = config.retain(options::non_zero("--retain", *retain)?);
    }
    config.validate()?;
    let backend = config.storage.open()?;

    match cli.command {
        Commands::Archive { files } => commands::archive::run(&config, &backend, files).await?,
        Commands::Basebackup { command } => {
            if let Some(command) = command {
                config = config.basebackup_command(command);
            }
            commands::basebackup::run(&config, &backend).await?;
        }
        Commands::Restore {
            backup,
            target_dir,
            output,
        } => commands::restore::run(&config, &backend, &backup, target_dir, output).await?,
        Commands::FetchWal { name, destination } => {
            commands::fetch_wal::run(&config, &backend, &name, &destination).await?;
        }
        Commands::Cleanup {
            dry_run, format, ..
        } => commands::cleanup::run(&config, &backend, dry_run, format).await?,
        Commands::Ls { format } => commands::ls::run(backend.as_ref(), format).await?,
        Commands::Version => {}
    }

    Ok(())
}
