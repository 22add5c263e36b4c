//! vigil-recovery — automated remediation for the Vigil engine.
//!
//! An *attempt set* is one ordered run of a service's recovery actions;
//! it succeeds only if every action succeeds. Between sets the backoff
//! doubles from `backoff_base` up to `backoff_cap`, and a service gets at
//! most `max_attempts` sets per incident.
//!
//! Backoff progress lives in the service record (`RecoveryProgress`), not
//! in a timer, so `next_attempt` can be re-evaluated on any tick and after
//! a restart.

pub mod executor;
pub mod runner;
pub mod schedule;

pub use executor::RecoveryExecutor;
pub use runner::{ActionFuture, ActionRunner, StandardRunner};
pub use schedule::{next_attempt, NextAttempt};
