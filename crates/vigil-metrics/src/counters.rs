//! Engine-wide counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use vigil_state::CheckOutcome;

/// Monotonic counters updated by the service pipelines.
///
/// Read-mostly and lock-free; the only shared mutable state besides the
/// store.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    checks_success: AtomicU64,
    checks_failure: AtomicU64,
    checks_timeout: AtomicU64,
    transitions: AtomicU64,
    incidents_opened: AtomicU64,
    incidents_escalated: AtomicU64,
    incidents_resolved: AtomicU64,
    recovery_sets_succeeded: AtomicU64,
    recovery_sets_failed: AtomicU64,
    notifications_delivered: AtomicU64,
    notifications_failed: AtomicU64,
    notifications_suppressed: AtomicU64,
    store_errors: AtomicU64,
    degraded: AtomicBool,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checks_success: u64,
    pub checks_failure: u64,
    pub checks_timeout: u64,
    pub transitions: u64,
    pub incidents_opened: u64,
    pub incidents_escalated: u64,
    pub incidents_resolved: u64,
    pub recovery_sets_succeeded: u64,
    pub recovery_sets_failed: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub notifications_suppressed: u64,
    pub store_errors: u64,
    pub degraded: bool,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&self, outcome: &CheckOutcome) {
        match outcome {
            CheckOutcome::Success => bump(&self.checks_success),
            CheckOutcome::Failure { .. } => bump(&self.checks_failure),
            CheckOutcome::Timeout => bump(&self.checks_timeout),
        }
    }

    pub fn record_transitions(&self, count: usize) {
        self.transitions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn incident_opened(&self) {
        bump(&self.incidents_opened);
    }

    pub fn incident_escalated(&self) {
        bump(&self.incidents_escalated);
    }

    pub fn incident_resolved(&self) {
        bump(&self.incidents_resolved);
    }

    pub fn recovery_set(&self, succeeded: bool) {
        if succeeded {
            bump(&self.recovery_sets_succeeded);
        } else {
            bump(&self.recovery_sets_failed);
        }
    }

    pub fn notification_delivered(&self) {
        bump(&self.notifications_delivered);
    }

    pub fn notification_failed(&self) {
        bump(&self.notifications_failed);
    }

    pub fn notification_suppressed(&self) {
        bump(&self.notifications_suppressed);
    }

    pub fn store_error(&self) {
        bump(&self.store_errors);
    }

    /// Flip the engine-degraded flag; returns the previous value.
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.degraded.swap(degraded, Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            checks_success: get(&self.checks_success),
            checks_failure: get(&self.checks_failure),
            checks_timeout: get(&self.checks_timeout),
            transitions: get(&self.transitions),
            incidents_opened: get(&self.incidents_opened),
            incidents_escalated: get(&self.incidents_escalated),
            incidents_resolved: get(&self.incidents_resolved),
            recovery_sets_succeeded: get(&self.recovery_sets_succeeded),
            recovery_sets_failed: get(&self.recovery_sets_failed),
            notifications_delivered: get(&self.notifications_delivered),
            notifications_failed: get(&self.notifications_failed),
            notifications_suppressed: get(&self.notifications_suppressed),
            store_errors: get(&self.store_errors),
            degraded: self.is_degraded(),
        }
    }
}
