use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading or changing the inventory.
#[derive(Debug, Error)]
pub enum Error {
    /// The inventory path exists but is not a directory
    #[error("invalid inventory directory '{0}', must be a directory")]
    NotADirectory(PathBuf),

    /// A host entry exists but is not a regular file
    #[error("host path '{0}' exists, but is not a valid file")]
    NotAFile(PathBuf),

    /// Host name that cannot be stored as one file
    #[error("invalid host name: '{0}'")]
    InvalidHost(String),

    /// IO error with path context
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for inventory operations.
pub type Result<T> = std::result::Result<T, Error>;
