//! Error types for engine operations.
//!
//! Errors are grouped by [`ErrorScope`] so callers can decide whether a
//! failure stays with one object or takes down the whole host run.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Fatal to one object; dependents are skipped, the host run continues.
    Object,
    /// Fatal to the host run.
    Run,
    /// Misuse of an API (a bug in the caller).
    Programming,
}

impl ErrorScope {
    /// Whether an error of this scope aborts the host run.
    #[must_use]
    pub fn aborts_run(&self) -> bool {
        !matches!(self, Self::Object)
    }

    /// Get a user-friendly description of this scope.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Object => "object failure",
            Self::Run => "host run failure",
            Self::Programming => "internal error",
        }
    }
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur while converging a host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed type or search-path setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bad object parameters or object id.
    #[error("invalid invocation of {object}: {message}")]
    Validation {
        /// Object (or type) being declared.
        object: String,
        /// What was wrong.
        message: String,
    },

    /// Same object declared twice with different parameters.
    #[error("conflicting definition of {object}: {message}")]
    Conflict {
        /// Object declared twice.
        object: String,
        /// Which parameters differ.
        message: String,
    },

    /// Requirement graph has a cycle or names objects that never appeared.
    #[error(
        "unresolvable requirements between: {}{}",
        .objects.join(", "),
        format_missing(.missing)
    )]
    UnresolvableRequirements {
        /// Objects that could not make progress.
        objects: Vec<String>,
        /// Required objects that were never declared.
        missing: Vec<String>,
    },

    /// Copy or exec failed at the transport boundary.
    #[error("transport error: {0}")]
    Transport(String),

    /// Workspace allocator misuse.
    #[error("session index {index} out of range (expected 0 < index <= {max})")]
    Range {
        /// Index passed to `release`.
        index: usize,
        /// Current high-water mark.
        max: usize,
    },

    /// A beta feature was requested without enabling beta.
    #[error("'{feature}' is a beta feature; enable it with --beta or CONVERGE_BETA")]
    BetaRequired {
        /// The feature requested.
        feature: String,
    },

    /// The initial manifest exited non-zero.
    #[error("manifest {} failed:\n{stderr}", .path.display())]
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// Captured stderr.
        stderr: String,
    },

    /// A global explorer exited non-zero.
    #[error("global explorer {name} failed:\n{stderr}")]
    Explorer {
        /// Explorer name.
        name: String,
        /// Captured stderr.
        stderr: String,
    },

    /// IO error during file operations.
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

fn format_missing(missing: &[String]) -> String {
    if missing.is_empty() {
        String::new()
    } else {
        format!(" (never declared: {})", missing.join(", "))
    }
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a validation error.
    pub fn validation(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Get the propagation scope of this error.
    #[must_use]
    pub fn scope(&self) -> ErrorScope {
        match self {
            Error::Validation { .. } | Error::Conflict { .. } | Error::Transport(_) => {
                ErrorScope::Object
            }
            Error::Configuration(_)
            | Error::UnresolvableRequirements { .. }
            | Error::BetaRequired { .. }
            | Error::Manifest { .. }
            | Error::Explorer { .. }
            | Error::Io { .. } => ErrorScope::Run,
            Error::Range { .. } => ErrorScope::Programming,
        }
    }

    /// Whether this error only affects the object being worked on.
    #[must_use]
    pub fn is_object_scoped(&self) -> bool {
        self.scope() == ErrorScope::Object
    }
}
