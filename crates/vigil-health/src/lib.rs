//! vigil-health — health checking for the Vigil engine.
//!
//! Provides the probe capability (HTTP, TCP, command), the per-service
//! probe scheduler, and the health state machine that turns raw check
//! results into service transitions and incident lifecycle events.
//!
//! # Architecture
//!
//! ```text
//! ProbeScheduler
//!   └── Per-service background task
//!       ├── run_check(Probe, ServiceSpec) → CheckResult
//!       └── CheckCallback → service pipeline queue
//!
//! HealthMachine (pure)
//!   (ServiceRecord, open Incident, MachineInput) → Step
//!       ├── updated record + incident (committed atomically by the caller)
//!       ├── state transitions
//!       └── IncidentEvents (opened / escalated / resolved)
//! ```
//!
//! The machine never touches the store. The service pipeline persists each
//! `Step` before anything downstream sees its events.

pub mod machine;
pub mod probe;
pub mod scheduler;

pub use machine::{ExternalEvent, HealthMachine, IncidentEvent, MachineInput, Step, Transition};
pub use probe::{run_check, Probe, ProbeFuture, StandardProbe};
pub use scheduler::{CheckCallback, CheckFuture, ProbeScheduler};
