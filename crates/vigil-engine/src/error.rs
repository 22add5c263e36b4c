//! Error types for the Vigil engine.

use std::path::PathBuf;

use thiserror::Error;

use vigil_notify::NotifyError;
use vigil_state::StateError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("pipeline for {0} is not running")]
    Stopped(String),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("failed to prepare data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}
