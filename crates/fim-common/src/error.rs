//! Unified error type for the fim workspace.
//!
//! Every failure that `fim` itself detects maps onto exit status 125 at the
//! CLI boundary; only the sandboxed program's own status is passed through.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum FimError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value or on-disk record is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A command-line token or argument failed validation.
    #[error("{message}")]
    Usage {
        /// Message naming the offending token.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Mounting or unmounting a filesystem failed.
    #[error("mount failed: {message}")]
    Mount {
        /// Description of the failure.
        message: String,
    },

    /// A spawned helper process could not be run.
    #[error("failed to run '{program}': {message}")]
    Process {
        /// Program that failed.
        program: String,
        /// Description of the failure.
        message: String,
    },

    /// The managed layer slot namespace is full.
    #[error("Maximum number of layers exceeded")]
    LayerSlotsExhausted,

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl FimError {
    /// Builds a [`FimError::Usage`] from anything printable.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Builds an `Io` error bound to `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FimError>;
