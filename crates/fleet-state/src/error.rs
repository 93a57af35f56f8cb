//! Error types for the fleet state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule or the release immutability rule was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Input was rejected before anything was written.
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("checksum mismatch: expected [{expected}], found [{actual}]")]
    ChecksumMismatch { expected: String, actual: String },
}
