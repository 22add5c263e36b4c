//! vigil-engine — the monitoring and auto-recovery engine.
//!
//! Ties the probe scheduler, health state machine, recovery executor and
//! notification dispatcher together, one pipeline per service.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── ProbeScheduler ── CheckResult ──┐
//!   ├── ingest(ExternalEvent) ──────────┤
//!   └── per-service Pipeline ◀──────────┘  (bounded queue, single writer)
//!         ├── HealthMachine → StateStore::commit_transition
//!         ├── Dispatcher (dedup, persist, deliver)
//!         └── RecoveryExecutor (attempt sets, persisted backoff)
//!
//! SelfMonitor: store failures → degraded engine alert, recovery notice
//! ```
//!
//! Services never wait on each other. A store outage halts only the
//! pipelines that touch it, and each retries its current input until the
//! store answers.

pub mod engine;
pub mod error;
mod pipeline;
pub mod self_monitor;

pub use engine::{Engine, EngineBuilder, ReloadSummary, STATE_FILE};
pub use error::{EngineError, EngineResult};
pub use self_monitor::SelfMonitor;
