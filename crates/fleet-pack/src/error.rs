//! Error types for package building, distribution and import.

use std::path::PathBuf;

use fleet_core::{ManifestError, PortRangeError};
use fleet_state::StateError;
use thiserror::Error;

pub type PackResult<T> = Result<T, PackError>;

/// Coarse classification of a [`PackError`], for callers that decide
/// between retrying, reporting and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input detected before any persistent mutation.
    Validation,
    /// Released artifact overwrite or duplicate unique key.
    Conflict,
    /// Filesystem failure; may leave an artifact existing but not ready.
    Io,
    /// Archive member escapes its destination.
    Security,
    NotFound,
    /// State store failure unrelated to the rules above.
    State,
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("invalid port range for {key}: {source}")]
    PortRange {
        key: String,
        #[source]
        source: PortRangeError,
    },

    #[error("package {key} is released and cannot be overwritten")]
    Released { key: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path traversal in {archive}: member {member:?} escapes {dest}")]
    PathTraversal {
        archive: PathBuf,
        member: String,
        dest: PathBuf,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl PackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackError::Manifest(ManifestError::Read { .. }) => ErrorKind::Io,
            PackError::Manifest(_) | PackError::PortRange { .. } | PackError::Validation(_) => {
                ErrorKind::Validation
            }
            PackError::Released { .. } | PackError::Conflict(_) => ErrorKind::Conflict,
            PackError::Io { .. } => ErrorKind::Io,
            PackError::PathTraversal { .. } => ErrorKind::Security,
            PackError::NotFound(_) => ErrorKind::NotFound,
            PackError::State(err) => match err {
                StateError::Conflict(_) => ErrorKind::Conflict,
                StateError::NotFound(_) => ErrorKind::NotFound,
                StateError::Invalid(_) | StateError::ChecksumMismatch { .. } => {
                    ErrorKind::Validation
                }
                _ => ErrorKind::State,
            },
        }
    }
}

/// Attach a description (usually naming the path) to an I/O error.
pub(crate) trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> PackResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> PackResult<T> {
        self.map_err(|source| PackError::Io {
            context: context(),
            source,
        })
    }
}
