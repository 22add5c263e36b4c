//! Error types for notification delivery.

use thiserror::Error;

use vigil_state::StateError;

/// Result type alias for notification operations.
pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),

    #[error("channel {channel} answered HTTP {status}")]
    Rejected { channel: String, status: u16 },

    #[error("channel {channel} unreachable: {reason}")]
    Transport { channel: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error(transparent)]
    State(#[from] StateError),
}
