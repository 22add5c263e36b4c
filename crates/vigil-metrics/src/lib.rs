//! vigil-metrics — observability for the Vigil engine.
//!
//! ```text
//! EngineMetrics (lock-free counters, shared by every pipeline)
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus(snapshot, service records) → text/plain for /metrics
//! ```

pub mod counters;
pub mod prometheus;

pub use counters::{EngineMetrics, MetricsSnapshot};
pub use prometheus::render_prometheus;
