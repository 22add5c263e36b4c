//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating `vigil.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: String, value: String },

    #[error("service {service}: {reason}")]
    Service { service: String, reason: String },

    #[error("duplicate service id: {0}")]
    DuplicateService(String),

    #[error("unknown notification channel {channel:?} referenced by {referenced_by}")]
    UnknownChannel {
        channel: String,
        referenced_by: String,
    },

    #[error("invalid notify settings: {0}")]
    Notify(String),
}
