//! Global flags and their translation into a [`Config`].

use clap::{Args, ValueEnum};
use pgkeep_core::{CommandSpec, Config, CoreError, CoreResult, FilterConfig, StorageConfig};
use pgkeep_storage::ObjectStoreConfig;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Output format for reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable text
    Text,
    /// JSON document
    Json,
}

/// Flags shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalOptions {
    /// Cluster name used in basebackup names
    #[arg(global = true, long, default_value = "main")]
    cluster: String,

    /// Filesystem storage root
    #[arg(global = true, short, long, conflicts_with = "bucket")]
    path: Option<PathBuf>,

    /// Object store bucket
    #[arg(global = true, long)]
    bucket: Option<String>,

    /// Object store endpoint URL
    #[arg(global = true, long)]
    endpoint: Option<String>,

    /// Object store region
    #[arg(global = true, long)]
    region: Option<String>,

    /// Object store access key
    #[arg(global = true, long, requires = "secret_key")]
    access_key: Option<String>,

    /// Object store secret key
    #[arg(global = true, long, requires = "access_key")]
    secret_key: Option<String>,

    /// Key prefix inside the bucket
    #[arg(global = true, long)]
    prefix: Option<String>,

    /// Object store request timeout in seconds
    #[arg(global = true, long)]
    request_timeout: Option<u64>,

    /// Multipart upload part size in bytes
    #[arg(global = true, long)]
    part_size: Option<usize>,

    /// Compression command
    #[arg(global = true, long, value_parser = parse_command)]
    compress: Option<CommandSpec>,

    /// Decompression command
    #[arg(global = true, long, value_parser = parse_command)]
    decompress: Option<CommandSpec>,

    /// Extension appended by the compression command
    #[arg(global = true, long)]
    extension: Option<String>,

    /// Encryption command
    #[arg(global = true, long, value_parser = parse_command)]
    encrypt: Option<CommandSpec>,

    /// Decryption command
    #[arg(global = true, long, value_parser = parse_command)]
    decrypt: Option<CommandSpec>,

    /// Extra storage root whose wal/ subdirectory is pruned by cleanup (repeatable)
    #[arg(global = true, long = "wal-archive-dir")]
    wal_archive_dirs: Vec<PathBuf>,

    /// Concurrent deletes against an object store
    #[arg(global = true, long)]
    delete_parallelism: Option<usize>,
}

impl GlobalOptions {
    /// Builds the configuration described by the flags.
    pub fn to_config(&self) -> CoreResult<Config> {
        let mut config = Config::new()
            .cluster_name(self.cluster.clone())
            .storage(self.storage())
            .filters(self.filters());
        if let Some(workers) = self.delete_parallelism {
            config = config.delete_parallelism(non_zero("--delete-parallelism", workers)?);
        }
        for dir in &self.wal_archive_dirs {
            config = config.wal_archive_dir(dir.clone());
        }
        Ok(config)
    }

    fn storage(&self) -> StorageConfig {
        let Some(bucket) = &self.bucket else {
            return StorageConfig {
                path: self.path.clone(),
                object_store: None,
            };
        };

        let mut store = ObjectStoreConfig::new(bucket.clone());
        if let Some(endpoint) = &self.endpoint {
            store = store.with_endpoint(endpoint.clone());
        }
        if let Some(region) = &self.region {
            store.region = region.clone();
        }
        if let (Some(access), Some(secret)) = (&self.access_key, &self.secret_key) {
            store = store.with_credentials(access.clone(), secret.clone());
        }
        if let Some(prefix) = &self.prefix {
            store = store.with_prefix(prefix.clone());
        }
        if let Some(secs) = self.request_timeout {
            store = store.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(part_size) = self.part_size {
            store = store.with_part_size(part_size);
        }
        StorageConfig::object_store(store)
    }

    fn filters(&self) -> FilterConfig {
        let defaults = FilterConfig::default();
        FilterConfig {
            compress: self.compress.clone().unwrap_or(defaults.compress),
            decompress: self.decompress.clone().unwrap_or(defaults.decompress),
            encrypt: self.encrypt.clone(),
            decrypt: self.decrypt.clone(),
            extension: self.extension.clone().unwrap_or(defaults.extension),
        }
    }
}

/// Parses a filter or source command given on the command line.
pub fn parse_command(value: &str) -> Result<CommandSpec, String> {
    value.parse().map_err(|err: CoreError| err.to_string())
}

/// Converts a count flag, rejecting zero.
pub fn non_zero(flag: &str, value: usize) -> CoreResult<NonZeroUsize> {
    NonZeroUsize::new(value)
        .ok_or_else(|| CoreError::invalid_config(format!("{flag} must be at least 1")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        global: GlobalOptions,
    }

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["pgkeep"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().global.to_config().unwrap()
    }

    #[test]
    fn defaults_use_zstd_and_no_storage() {
        let config = parse(&[]);
        assert_eq!(config.cluster_name, "main");
        assert_eq!(config.filters, FilterConfig::default());
        assert!(config.storage.kind().is_err());
    }

    #[test]
    fn object_store_flags_build_store_config() {
        let config = parse(&[
            "--bucket",
            "backups",
            "--endpoint",
            "http://localhost:9000",
            "--access-key",
            "minio",
            "--secret-key",
            "minio123",
            "--prefix",
            "db1",
            "--request-timeout",
            "30",
        ]);
        let store = config.storage.object_store.unwrap();
        assert_eq!(store.bucket, "backups");
        assert_eq!(store.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(store.prefix, "db1");
        assert_eq!(store.request_timeout, Some(Duration::from_secs(30)));
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn filter_flags_override_defaults() {
        let config = parse(&[
            "--path",
            "/b",
            "--compress",
            "lz4 -q -c",
            "--decompress",
            "lz4 -q -d -c",
            "--extension",
            ".lz4",
            "--encrypt",
            "gpg -e -r ops",
            "--decrypt",
            "gpg -d",
        ]);
        assert_eq!(config.filters.compress.program, "lz4");
        assert_eq!(config.filters.extension, ".lz4");
        assert_eq!(config.filters.decrypt.unwrap().to_string(), "gpg -d");
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert!(non_zero("--retain", 0).is_err());
        let harness = Harness::try_parse_from(["pgkeep", "--delete-parallelism", "0"]).unwrap();
        assert!(harness.global.to_config().is_err());
    }

    #[test]
    fn path_and_bucket_conflict() {
        assert!(Harness::try_parse_from(["pgkeep", "--path", "/b", "--bucket", "x"]).is_err());
    }
}
