//! Error types for coedit-core

use thiserror::Error;

use crate::models::ConflictReport;

/// Result type alias using coedit-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coedit-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Resource or session not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Field is not part of the resource kind's schema
    #[error("Unknown field `{field}` for resource kind `{kind}`")]
    UnknownField { kind: String, field: String },

    /// Field value does not match the declared type
    #[error("Invalid value for field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Whole-record compare-and-swap lost against a concurrent writer
    #[error("Version conflict on {resource}: expected {expected}, found {actual}")]
    VersionConflict {
        resource: String,
        expected: u64,
        actual: u64,
    },

    /// Field-level contention; the caller must re-submit against a fresh version
    #[error("Conflict on fields {:?} at version {}", .0.conflicting_fields, .0.current_version)]
    Conflict(Box<ConflictReport>),

    /// Ephemeral presence store unavailable
    #[error("Transient store failure: {0}")]
    TransientStore(String),

    /// Subscriber transport dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl Error {
    /// Whether this error is a validation failure of caller input
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::UnknownField { .. } | Self::InvalidField { .. }
        )
    }
}
