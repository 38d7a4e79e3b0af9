//! Error types shared by the storage engine and the document sessions.

use thiserror::Error;

/// Errors returned by storage engine operations.
///
/// `NotFound` and `Conflict` are recoverable and handled inside a document
/// session. Everything else is reported through `tracing` and swallowed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Transient engine error: {0}")]
    Transient(String),

    #[error("Unrecoverable engine error: {0}")]
    Unrecoverable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// HTTP-style status code, matching what replicated document stores report.
    pub fn status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::Transient(_) => 503,
            StoreError::Unrecoverable(_) => 500,
            StoreError::Serialization(_) => 400,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    /// Whether a replication pass that failed with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
