//! vigil-core — shared definitions for the Vigil monitoring engine.
//!
//! Holds the static per-run description of the monitored fleet
//! (`ServiceSpec` and friends), the `vigil.toml` parser that produces it,
//! duration parsing, and the engine clock.

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use clock::Clock;
pub use config::{EngineSettings, NotifySettings, Settings, VigilConfig};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
