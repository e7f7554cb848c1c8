//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested object does not exist.
    #[error("object not found: {category}/{name}")]
    NotFound {
        /// The storage category searched.
        category: String,
        /// The object name that was not found.
        name: String,
    },

    /// The object exists but reports no content.
    #[error("object {name} is empty (reported size {size})")]
    EmptyObject {
        /// The object name.
        name: String,
        /// The size reported by the backend.
        size: i64,
    },

    /// The object name is not usable as a storage key.
    #[error("invalid object name: {0:?}")]
    InvalidName(String),

    /// The object store rejected or failed a request.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// An object store request exceeded the configured timeout.
    #[error("object store request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The backend configuration is unusable.
    #[error("invalid storage configuration: {0}")]
    Config(String),

    /// A streaming producer task ended abnormally.
    #[error("stream producer failed: {0}")]
    Producer(String),
}

impl StorageError {
    /// Creates a not-found error for the given category and object name.
    pub fn not_found(category: impl std::fmt::Display, name: impl Into<String>) -> Self {
        Self::NotFound {
            category: category.to_string(),
            name: name.into(),
        }
    }

    /// Returns true if this error reports a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<s3::error::S3Error> for StorageError {
    fn from(err: s3::error::S3Error) -> Self {
        Self::ObjectStore(err.to_string())
    }
}

impl From<s3::creds::error::CredentialsError> for StorageError {
    fn from(err: s3::creds::error::CredentialsError) -> Self {
        Self::Config(format!("credentials: {err}"))
    }
}
