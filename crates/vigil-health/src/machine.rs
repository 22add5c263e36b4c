//! Health state machine.
//!
//! Pure transition logic: given the current service record, its open
//! incident (if any) and one input, compute the next record, the incident
//! to write, and the lifecycle events to publish. Nothing here performs
//! I/O; the caller commits the returned `Step` atomically.
//!
//! ```text
//! Healthy ──fail──▶ Degraded ──fail × threshold──▶ Unhealthy ──▶ Recovering
//!    ▲                 │                              │            │
//!    └──────ok─────────┘                              │            ▼
//!    ▲                                                │        Escalated
//!    └────────────── ok × success_threshold ──────────┴────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vigil_core::{ServiceSpec, Severity};
use vigil_state::{
    CheckResult, Incident, IncidentSource, IncidentState, NotificationKind, RecoveryProgress,
    RecoveryReport, ServiceRecord, ServiceState,
};

/// An incident raised from outside the probe path (e.g. a log scanner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub service_id: String,
    pub severity: Severity,
    pub cause: String,
}

/// Everything a service pipeline feeds into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineInput {
    Check(CheckResult),
    External(ExternalEvent),
    /// An attempt set finished.
    Recovery(RecoveryReport),
    /// The backoff deadline passed with no attempt sets left.
    RecoveryExhausted,
}

/// One state change, in the order it happened within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ServiceState,
    pub to: ServiceState,
}

/// A lifecycle event for the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentEvent {
    pub kind: NotificationKind,
    /// Snapshot of the incident after the step.
    pub incident: Incident,
}

/// Result of applying one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub record: ServiceRecord,
    /// Incident to write alongside the record (new or changed).
    pub incident: Option<Incident>,
    pub transitions: Vec<Transition>,
    pub events: Vec<IncidentEvent>,
}

impl Step {
    /// Final service state after the step.
    pub fn state(&self) -> ServiceState {
        self.record.state
    }

    /// Whether the step opened a new incident.
    pub fn opened(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == NotificationKind::Opened)
    }
}

/// Applies inputs for one service according to its spec.
#[derive(Debug, Clone, Copy)]
pub struct HealthMachine<'a> {
    spec: &'a ServiceSpec,
    /// Check results retained in the record.
    history: usize,
}

impl<'a> HealthMachine<'a> {
    pub fn new(spec: &'a ServiceSpec, history: usize) -> Self {
        Self { spec, history }
    }

    /// Compute the next step. `incident` must be the record's open incident.
    pub fn apply(
        &self,
        record: &ServiceRecord,
        incident: Option<&Incident>,
        input: &MachineInput,
        now: u64,
    ) -> Step {
        let mut step = Step {
            record: record.clone(),
            incident: incident
                .filter(|i| record.open_incident.as_deref() == Some(i.id.as_str()))
                .cloned(),
            transitions: Vec::new(),
            events: Vec::new(),
        };
        step.record.updated_at = now;
        let touched = match input {
            MachineInput::Check(result) => self.on_check(&mut step, result, now),
            MachineInput::External(event) => self.on_external(&mut step, event, now),
            MachineInput::Recovery(report) => self.on_recovery(&mut step, report, now),
            MachineInput::RecoveryExhausted => {
                if step.record.state == ServiceState::Recovering {
                    self.escalate(&mut step, "recovery budget exhausted");
                    true
                } else {
                    false
                }
            }
        };
        if !touched {
            step.incident = None;
        }
        step
    }

    /// Returns whether the incident changed.
    fn on_check(&self, step: &mut Step, result: &CheckResult, now: u64) -> bool {
        step.record.push_check(result.clone(), self.history);
        let record = &mut step.record;

        if result.outcome.is_success() {
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
            match record.state {
                ServiceState::Healthy => false,
                ServiceState::Degraded => {
                    move_to(step, ServiceState::Healthy);
                    false
                }
                ServiceState::Unhealthy | ServiceState::Recovering | ServiceState::Escalated => {
                    if record.consecutive_successes >= self.spec.success_threshold {
                        self.resolve(step, now);
                        true
                    } else {
                        false
                    }
                }
            }
        } else {
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
            let reached = record.consecutive_failures >= self.spec.failure_threshold;
            match record.state {
                ServiceState::Healthy | ServiceState::Degraded => {
                    if reached {
                        let cause = result.outcome.reason().unwrap_or("probe failed").to_string();
                        self.open(step, self.spec.severity, cause, IncidentSource::Probe, now)
                    } else {
                        if record.state == ServiceState::Healthy {
                            move_to(step, ServiceState::Degraded);
                        }
                        false
                    }
                }
                // Already counted against an open incident.
                ServiceState::Unhealthy | ServiceState::Recovering | ServiceState::Escalated => {
                    false
                }
            }
        }
    }

    fn on_external(&self, step: &mut Step, event: &ExternalEvent, now: u64) -> bool {
        step.record.consecutive_successes = 0;
        if let Some(incident) = step.incident.as_mut() {
            if event.severity <= incident.severity {
                debug!(service = %self.spec.id, incident = %incident.id, "external event folded into open incident");
                return false;
            }
            info!(
                service = %self.spec.id,
                incident = %incident.id,
                from = %incident.severity,
                to = %event.severity,
                "incident severity raised by external event"
            );
            incident.severity = event.severity;
            incident.cause = event.cause.clone();
            let snapshot = incident.clone();
            step.events.push(IncidentEvent {
                kind: NotificationKind::Opened,
                incident: snapshot,
            });
            return true;
        }
        if step.record.state.has_incident() {
            // Record claims an incident we were not given; never open a second.
            warn!(service = %self.spec.id, state = %step.record.state, "external event without incident snapshot ignored");
            return false;
        }
        self.open(
            step,
            event.severity,
            event.cause.clone(),
            IncidentSource::External,
            now,
        )
    }

    fn on_recovery(&self, step: &mut Step, report: &RecoveryReport, now: u64) -> bool {
        let record = &mut step.record;
        let current = record.state == ServiceState::Recovering
            && record.open_incident.as_deref() == Some(report.incident_id.as_str());
        let Some(progress) = record.recovery.as_mut().filter(|_| current) else {
            debug!(service = %self.spec.id, incident = %report.incident_id, "stale recovery report ignored");
            return false;
        };
        if report.attempt_number <= progress.attempts_made {
            debug!(service = %self.spec.id, attempt = report.attempt_number, "duplicate recovery report ignored");
            return false;
        }

        progress.attempts_made = report.attempt_number;
        let backoff = self.spec.recovery.backoff_after(progress.attempts_made);
        progress.next_eligible_at = now.saturating_add(backoff.as_millis() as u64);
        let spent = progress.attempts_made >= self.spec.recovery.max_attempts;

        if !report.succeeded && (report.exhausted || spent) {
            self.escalate(step, "recovery attempts exhausted");
            return true;
        }
        debug!(
            service = %self.spec.id,
            attempt = report.attempt_number,
            succeeded = report.succeeded,
            next_eligible_at = progress.next_eligible_at,
            "recovery attempt set recorded"
        );
        false
    }

    /// Open an incident unless one is already open. Returns whether one was opened.
    fn open(
        &self,
        step: &mut Step,
        severity: Severity,
        cause: String,
        source: IncidentSource,
        now: u64,
    ) -> bool {
        if step.record.open_incident.is_some() {
            return false;
        }
        move_to(step, ServiceState::Unhealthy);

        let id = step.record.next_incident_id();
        let mut incident = Incident::open(id.clone(), &self.spec.id, severity, cause, source, now);
        step.record.open_incident = Some(id.clone());
        info!(service = %self.spec.id, incident = %id, %severity, cause = %incident.cause, "incident opened");

        if self.spec.recovery.is_enabled() {
            move_to(step, ServiceState::Recovering);
            incident.state = IncidentState::Recovering;
            step.record.recovery = Some(RecoveryProgress {
                incident_id: id,
                attempts_made: 0,
                next_eligible_at: now,
            });
        } else {
            step.record.recovery = None;
        }

        step.events.push(IncidentEvent {
            kind: NotificationKind::Opened,
            incident: incident.clone(),
        });
        step.incident = Some(incident);
        true
    }

    fn escalate(&self, step: &mut Step, reason: &str) {
        move_to(step, ServiceState::Escalated);
        if let Some(incident) = step.incident.as_mut() {
            incident.state = IncidentState::Escalated;
            incident.severity = incident.severity.max(Severity::Critical);
            warn!(service = %self.spec.id, incident = %incident.id, %reason, "incident escalated");
            step.events.push(IncidentEvent {
                kind: NotificationKind::Escalated,
                incident: incident.clone(),
            });
        }
    }

    fn resolve(&self, step: &mut Step, now: u64) {
        move_to(step, ServiceState::Healthy);
        step.record.open_incident = None;
        step.record.recovery = None;
        step.record.consecutive_failures = 0;
        if let Some(incident) = step.incident.as_mut() {
            incident.state = IncidentState::Resolved;
            incident.closed_at = Some(now);
            info!(service = %self.spec.id, incident = %incident.id, "incident resolved");
            step.events.push(IncidentEvent {
                kind: NotificationKind::Resolved,
                incident: incident.clone(),
            });
        }
    }
}

fn move_to(step: &mut Step, to: ServiceState) {
    let from = step.record.state;
    if from != to {
        step.record.state = to;
        step.transitions.push(Transition { from, to });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vigil_core::{ProbeSpec, RecoveryAction, RecoveryActionSpec};
    use vigil_state::CheckOutcome;

    use super::*;

    fn spec(failure_threshold: u32, success_threshold: u32) -> ServiceSpec {
        let mut spec = ServiceSpec::new(
            "api",
            ProbeSpec::Tcp {
                address: "127.0.0.1:1".to_string(),
            },
        );
        spec.failure_threshold = failure_threshold;
        spec.success_threshold = success_threshold;
        spec
    }

    fn with_recovery(mut spec: ServiceSpec, max_attempts: u32) -> ServiceSpec {
        spec.recovery.actions.push(RecoveryActionSpec {
            name: "restart".to_string(),
            action: RecoveryAction::Command {
                command: "true".to_string(),
                args: vec![],
            },
        });
        spec.recovery.max_attempts = max_attempts;
        spec.recovery.backoff_base = Duration::from_secs(1);
        spec.recovery.backoff_cap = Duration::from_secs(60);
        spec
    }

    fn check(ok: bool, ts: u64) -> MachineInput {
        MachineInput::Check(CheckResult {
            service_id: "api".to_string(),
            timestamp: ts,
            outcome: if ok {
                CheckOutcome::Success
            } else {
                CheckOutcome::failure("connection refused")
            },
            latency_ms: 1,
        })
    }

    /// Feeds inputs through the machine, carrying record and incident along.
    struct Harness<'a> {
        machine: HealthMachine<'a>,
        record: ServiceRecord,
        incident: Option<Incident>,
        now: u64,
        steps: Vec<Step>,
    }

    impl<'a> Harness<'a> {
        fn new(spec: &'a ServiceSpec) -> Self {
            Self {
                machine: HealthMachine::new(spec, 20),
                record: ServiceRecord::new("api", 0),
                incident: None,
                now: 0,
                steps: Vec::new(),
            }
        }

        fn feed(&mut self, input: MachineInput) -> &Step {
            self.now += 1000;
            let step = self
                .machine
                .apply(&self.record, self.incident.as_ref(), &input, self.now);
            self.record = step.record.clone();
            if let Some(incident) = &step.incident {
                self.incident = Some(incident.clone()).filter(Incident::is_open);
            }
            self.steps.push(step);
            self.steps.last().unwrap()
        }

        fn checks(&mut self, pattern: &[bool]) -> Vec<ServiceState> {
            pattern
                .iter()
                .map(|ok| {
                    let ts = self.now;
                    self.feed(check(*ok, ts)).state()
                })
                .collect()
        }

        fn events(&self, kind: NotificationKind) -> usize {
            self.steps
                .iter()
                .flat_map(|s| &s.events)
                .filter(|e| e.kind == kind)
                .count()
        }

        fn report(&mut self, attempt_number: u32, succeeded: bool) -> &Step {
            let incident_id = self.record.open_incident.clone().unwrap();
            self.feed(MachineInput::Recovery(RecoveryReport {
                incident_id,
                attempt_number,
                succeeded,
                exhausted: false,
            }))
        }
    }

    // ── Threshold scenarios ────────────────────────────────────────

    #[test]
    fn failures_open_incident_on_threshold() {
        let spec = spec(3, 2);
        let mut h = Harness::new(&spec);

        let states = h.checks(&[true, true, false, false, false]);
        assert_eq!(
            states,
            vec![
                ServiceState::Healthy,
                ServiceState::Healthy,
                ServiceState::Degraded,
                ServiceState::Degraded,
                ServiceState::Unhealthy,
            ]
        );
        assert!(h.steps[4].opened());
        assert_eq!(h.events(NotificationKind::Opened), 1);
        let incident = h.incident.as_ref().unwrap();
        assert_eq!(incident.id, "api-00001");
        assert_eq!(incident.cause, "connection refused");
        assert_eq!(incident.source, IncidentSource::Probe);
    }

    #[test]
    fn incident_closes_only_on_success_streak() {
        let spec = spec(1, 2);
        let mut h = Harness::new(&spec);
        h.checks(&[false]);
        assert_eq!(h.record.state, ServiceState::Unhealthy);

        let states = h.checks(&[false, true, false, true, true]);
        assert_eq!(
            states,
            vec![
                ServiceState::Unhealthy,
                ServiceState::Unhealthy,
                ServiceState::Unhealthy,
                ServiceState::Unhealthy,
                ServiceState::Healthy,
            ]
        );
        assert_eq!(h.events(NotificationKind::Resolved), 1);
        let resolved = h.steps.last().unwrap().incident.as_ref().unwrap();
        assert_eq!(resolved.state, IncidentState::Resolved);
        assert_eq!(resolved.closed_at, Some(h.now));
        assert!(h.record.open_incident.is_none());
    }

    #[test]
    fn threshold_one_skips_degraded() {
        let spec = spec(1, 1);
        let mut h = Harness::new(&spec);
        let step = h.feed(check(false, 0));
        assert_eq!(
            step.transitions,
            vec![Transition {
                from: ServiceState::Healthy,
                to: ServiceState::Unhealthy
            }]
        );
    }

    #[test]
    fn degraded_recovers_on_single_success() {
        let spec = spec(3, 5);
        let mut h = Harness::new(&spec);
        let states = h.checks(&[false, false, true, false]);
        assert_eq!(
            states,
            vec![
                ServiceState::Degraded,
                ServiceState::Degraded,
                ServiceState::Healthy,
                ServiceState::Degraded,
            ]
        );
        assert_eq!(h.record.consecutive_failures, 1);
        assert_eq!(h.events(NotificationKind::Opened), 0);
    }

    #[test]
    fn at_most_one_open_incident_under_noise() {
        let spec = spec(2, 3);
        let mut h = Harness::new(&spec);
        let pattern = [
            false, false, false, true, false, false, true, true, false, false, false, true, true,
            true, false, false,
        ];
        for ok in pattern {
            let ts = h.now;
            h.feed(check(ok, ts));
            let opened = h.events(NotificationKind::Opened);
            let resolved = h.events(NotificationKind::Resolved);
            assert!(opened - resolved <= 1);
            assert_eq!(h.record.open_incident.is_some(), h.record.state.has_incident());
        }
        // Two separate incidents, the first resolved.
        assert_eq!(h.events(NotificationKind::Opened), 2);
        assert_eq!(h.events(NotificationKind::Resolved), 1);
        assert_eq!(h.record.open_incident.as_deref(), Some("api-00002"));
    }

    #[test]
    fn check_history_is_bounded() {
        let spec = spec(3, 2);
        let mut h = Harness::new(&spec);
        h.machine = HealthMachine::new(&spec, 4);
        h.checks(&[true; 10]);
        assert_eq!(h.record.recent_checks.len(), 4);
    }

    // ── Recovery ───────────────────────────────────────────────────

    #[test]
    fn open_with_recovery_enters_recovering() {
        let spec = with_recovery(spec(1, 1), 2);
        let mut h = Harness::new(&spec);
        let now = h.now + 1000;
        let step = h.feed(check(false, 0)).clone();

        assert_eq!(step.state(), ServiceState::Recovering);
        assert_eq!(step.transitions.len(), 2);
        let progress = step.record.recovery.unwrap();
        assert_eq!(progress.attempts_made, 0);
        assert_eq!(progress.next_eligible_at, now);
        assert_eq!(step.incident.unwrap().state, IncidentState::Recovering);
    }

    #[test]
    fn exhausted_recovery_escalates_once() {
        let spec = with_recovery(spec(1, 2), 2);
        let mut h = Harness::new(&spec);
        h.checks(&[false]);

        let first = h.report(1, false).clone();
        assert_eq!(first.state(), ServiceState::Recovering);
        let progress = first.record.recovery.unwrap();
        assert_eq!(progress.attempts_made, 1);
        assert_eq!(progress.next_eligible_at, h.now + 1000);

        let second = h.report(2, false).clone();
        assert_eq!(second.state(), ServiceState::Escalated);
        let incident = second.incident.unwrap();
        assert_eq!(incident.state, IncidentState::Escalated);
        assert_eq!(incident.severity, Severity::Critical);

        // Late duplicate report changes nothing.
        h.report(2, false);
        h.checks(&[false, false]);
        assert_eq!(h.events(NotificationKind::Escalated), 1);
        assert_eq!(h.record.state, ServiceState::Escalated);
    }

    #[test]
    fn escalated_resolves_on_success_streak() {
        let spec = with_recovery(spec(1, 2), 1);
        let mut h = Harness::new(&spec);
        h.checks(&[false]);
        h.report(1, false);
        assert_eq!(h.record.state, ServiceState::Escalated);

        assert_eq!(
            h.checks(&[true, true]),
            vec![ServiceState::Escalated, ServiceState::Healthy]
        );
        assert!(h.record.recovery.is_none());
        assert_eq!(h.events(NotificationKind::Resolved), 1);
    }

    #[test]
    fn successful_set_keeps_incident_open() {
        let spec = with_recovery(spec(1, 2), 3);
        let mut h = Harness::new(&spec);
        h.checks(&[false]);
        let step = h.report(1, true).clone();
        assert_eq!(step.state(), ServiceState::Recovering);
        assert!(step.incident.is_none());
        assert!(h.record.open_incident.is_some());
    }

    #[test]
    fn stale_report_for_other_incident_is_ignored() {
        let spec = with_recovery(spec(1, 1), 2);
        let mut h = Harness::new(&spec);
        h.checks(&[false]);
        let before = h.record.clone();
        let step = h
            .feed(MachineInput::Recovery(RecoveryReport {
                incident_id: "api-00099".to_string(),
                attempt_number: 1,
                succeeded: false,
                exhausted: true,
            }))
            .clone();
        assert_eq!(step.record.recovery, before.recovery);
        assert!(step.events.is_empty());
    }

    #[test]
    fn exhaustion_tick_escalates_recovering_only() {
        let spec = with_recovery(spec(1, 1), 1);
        let mut h = Harness::new(&spec);
        assert!(h.feed(MachineInput::RecoveryExhausted).events.is_empty());

        h.checks(&[false]);
        let step = h.feed(MachineInput::RecoveryExhausted);
        assert_eq!(step.state(), ServiceState::Escalated);
        assert_eq!(step.events[0].kind, NotificationKind::Escalated);
    }

    // ── External events ────────────────────────────────────────────

    fn external(severity: Severity) -> MachineInput {
        MachineInput::External(ExternalEvent {
            service_id: "api".to_string(),
            severity,
            cause: "OOM killer invoked".to_string(),
        })
    }

    #[test]
    fn external_event_opens_incident() {
        let spec = spec(3, 2);
        let mut h = Harness::new(&spec);
        let step = h.feed(external(Severity::Critical)).clone();

        assert_eq!(step.state(), ServiceState::Unhealthy);
        let incident = step.incident.unwrap();
        assert_eq!(incident.source, IncidentSource::External);
        assert_eq!(incident.severity, Severity::Critical);
        assert_eq!(incident.cause, "OOM killer invoked");
    }

    #[test]
    fn external_event_folds_into_open_incident() {
        let spec = spec(1, 2);
        let mut h = Harness::new(&spec);
        h.checks(&[false]);

        let same = h.feed(external(Severity::Minor)).clone();
        assert!(same.events.is_empty());
        assert!(same.incident.is_none());

        let raised = h.feed(external(Severity::Critical)).clone();
        assert_eq!(raised.events.len(), 1);
        assert_eq!(raised.events[0].incident.severity, Severity::Critical);
        assert_eq!(h.record.open_incident.as_deref(), Some("api-00001"));
        assert_eq!(h.record.incident_seq, 1);
    }

    #[test]
    fn external_event_resets_success_streak() {
        let spec = spec(1, 2);
        let mut h = Harness::new(&spec);
        h.checks(&[false, true]);
        h.feed(external(Severity::Minor));
        assert_eq!(h.checks(&[true]), vec![ServiceState::Unhealthy]);
    }
}
