//! Error types for pgkeep core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in pgkeep core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] pgkeep_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A WAL name, backup name or backup label could not be parsed.
    #[error("parse error: {message}")]
    Parse {
        /// Description of what failed to parse.
        message: String,
    },

    /// A required entity could not be located.
    #[error("not found: {what}")]
    NotFound {
        /// What was searched for.
        what: String,
    },

    /// Fewer sane backups exist than the retention quota asks to keep.
    #[error("insufficient backups: have {have}, retention requires {want}")]
    InsufficientBackups {
        /// Number of sane backups found.
        have: usize,
        /// Retention quota.
        want: usize,
    },

    /// Deletion left no sane backup behind, so no WAL threshold exists.
    #[error("no sane backups remain after deleting expired backups")]
    NoSaneBackups,

    /// An external filter stage exited unsuccessfully.
    #[error("stage '{stage}' failed (exit code {code:?}): {stderr}")]
    StageFailed {
        /// Stage name, e.g. `compress`.
        stage: String,
        /// Exit code, or `None` if killed by a signal.
        code: Option<i32>,
        /// Last lines the stage wrote to stderr.
        stderr: String,
    },

    /// The pipeline could not be assembled or joined.
    #[error("pipeline error: {message}")]
    Pipeline {
        /// Description of the failure.
        message: String,
    },

    /// Configuration is inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// At least one item of a batch operation failed.
    #[error("batch failed: {failed} failed, {succeeded} succeeded")]
    BatchFailed {
        /// Items that completed.
        succeeded: usize,
        /// Items that failed.
        failed: usize,
    },
}

impl CoreError {
    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true for parse errors, which callers skip instead of aborting.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}
