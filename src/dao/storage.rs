use std::path::PathBuf;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by token storage backends regardless of where the token lives.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading the token failed.
    #[error("failed to read token from `{path}`")]
    Read {
        /// Location that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// Writing or removing the token failed.
    #[error("failed to write token to `{path}`")]
    Write {
        /// Location that was written.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}
