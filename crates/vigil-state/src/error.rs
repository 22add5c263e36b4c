//! Error types for the Vigil state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// Every variant except `Conflict` and `NotFound` means the store could not
/// be trusted for this operation; callers abort the transition and retry.
#[derive(Debug, Clone, Error)]
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

    #[error("version conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("state store unavailable")]
    Unavailable,
}

impl StateError {
    /// Whether this error means the store itself is unreachable or broken
    /// (as opposed to a logical conflict or a missing record).
    pub fn is_persistence_failure(&self) -> bool {
        !matches!(self, Self::Conflict { .. } | Self::NotFound(_))
    }
}
