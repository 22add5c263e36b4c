//! Per-service pipeline.
//!
//! One task per service owns that service's record and open incident and
//! processes its inputs strictly in order: probe results, external events,
//! finished recovery sets and backoff deadlines. Each input is applied to
//! the health machine, committed to the store, and only then turned into
//! notifications and recovery work.
//!
//! ```text
//! input ─▶ HealthMachine::apply ─▶ commit_transition ─▶ dispatch events
//!                                        │                    │
//!                              store down: pause + retry      ▼
//!                                                     evaluate_recovery
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vigil_core::{Clock, EngineSettings, ServiceSpec};
use vigil_health::{ExternalEvent, HealthMachine, IncidentEvent, MachineInput, Step};
use vigil_metrics::EngineMetrics;
use vigil_notify::{DispatchOutcome, Dispatcher};
use vigil_recovery::{next_attempt, NextAttempt, RecoveryExecutor};
use vigil_state::{
    CheckResult, Incident, IncidentState, NotificationKind, RecoveryReport, ServiceRecord,
    ServiceState, StateError, StateResult, StateStore,
};

use crate::self_monitor::SelfMonitor;

/// Everything the pipelines share.
pub(crate) struct EngineContext {
    pub store: StateStore,
    pub clock: Clock,
    pub metrics: Arc<EngineMetrics>,
    pub dispatcher: Arc<Dispatcher>,
    pub executor: Arc<RecoveryExecutor>,
    pub monitor: SelfMonitor,
    pub settings: EngineSettings,
}

/// Work queued for a pipeline.
#[derive(Debug)]
pub(crate) enum PipelineInput {
    Check(CheckResult),
    External(ExternalEvent),
    RecoveryFinished {
        incident_id: String,
        attempt_number: u32,
        result: StateResult<RecoveryReport>,
    },
    /// Configuration for the service changed.
    Reload(Arc<ServiceSpec>),
}

/// Engine-side handle to a running pipeline.
pub(crate) struct PipelineHandle {
    pub tx: mpsc::Sender<PipelineInput>,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn spawn(ctx: Arc<EngineContext>, spec: Arc<ServiceSpec>) -> Self {
        let (tx, rx) = mpsc::channel(ctx.settings.queue_depth.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let now = ctx.clock.now_millis();
        let pipeline = Pipeline {
            record: ServiceRecord::new(spec.id.clone(), now),
            incident: None,
            in_flight: None,
            report_tx: tx.clone(),
            ctx,
            spec,
            stop_rx,
        };
        let join = tokio::spawn(pipeline.run(rx));
        Self { tx, stop_tx, join }
    }

    /// Ask the pipeline to stop without waiting for it.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the pipeline task to finish.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(error = %e, "pipeline task failed");
        }
    }

    pub async fn stop(self) {
        self.signal_stop();
        self.join().await;
    }
}

/// Whether the pipeline keeps going after an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Stop was requested while waiting for the store.
    Halted,
}

enum Wake {
    Stop,
    Input(PipelineInput),
    Deadline,
}

/// The attempt set currently running for the open incident.
struct InFlight {
    incident_id: String,
    attempt_number: u32,
    handle: JoinHandle<()>,
}

impl InFlight {
    fn matches(&self, incident_id: &str, attempt_number: u32) -> bool {
        self.incident_id == incident_id && self.attempt_number == attempt_number
    }
}

struct Pipeline {
    ctx: Arc<EngineContext>,
    spec: Arc<ServiceSpec>,
    record: ServiceRecord,
    /// The record's open incident, if any.
    incident: Option<Incident>,
    in_flight: Option<InFlight>,
    /// Finished recovery sets report back through the pipeline's own queue.
    report_tx: mpsc::Sender<PipelineInput>,
    stop_rx: watch::Receiver<bool>,
}

impl Pipeline {
    async fn run(mut self, mut rx: mpsc::Receiver<PipelineInput>) {
        info!(service = %self.spec.id, "pipeline starting");

        if self.startup().await == Flow::Halted {
            self.shutdown(&mut rx).await;
            return;
        }
        if self.evaluate_recovery().await == Flow::Halted {
            self.shutdown(&mut rx).await;
            return;
        }

        loop {
            if self.stop_requested() {
                break;
            }
            let deadline = self.recovery_deadline();
            let wake = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => Wake::Stop,
                input = rx.recv() => match input {
                    Some(input) => Wake::Input(input),
                    None => Wake::Stop,
                },
                _ = sleep_until_deadline(deadline) => Wake::Deadline,
            };

            let flow = match wake {
                Wake::Stop => break,
                Wake::Input(input) => self.handle(input).await,
                Wake::Deadline => Flow::Continue,
            };
            if flow == Flow::Halted || self.evaluate_recovery().await == Flow::Halted {
                break;
            }
        }

        self.shutdown(&mut rx).await;
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    // ── Startup ───────────────────────────────────────────────────

    /// Load the record, clear abandoned work and re-send anything a crash
    /// kept from going out. Retries while the store is down.
    async fn startup(&mut self) -> Flow {
        loop {
            match self.restore().await {
                Ok(()) => return Flow::Continue,
                Err(e) if e.is_persistence_failure() => {
                    if !self.store_failed(&e).await {
                        return Flow::Halted;
                    }
                }
                Err(e) => {
                    warn!(service = %self.spec.id, error = %e, "restore incomplete");
                    return Flow::Continue;
                }
            }
        }
    }

    async fn restore(&mut self) -> StateResult<()> {
        let store = &self.ctx.store;
        let now = self.ctx.clock.now_millis();
        let mut record = store.load_or_init_service(&self.spec.id, now)?;

        if record.pending {
            warn!(
                service = %self.spec.id,
                state = %record.state,
                "clearing work abandoned at shutdown"
            );
            record.pending = false;
            record.consecutive_failures = 0;
            record.consecutive_successes = 0;
            if let Some(progress) = record.recovery.as_mut() {
                progress.next_eligible_at = now;
            }
            record.updated_at = now;
            record = store.commit_transition(&record, None)?;
        }

        let incident = match record.open_incident.as_deref() {
            Some(id) => store.get_incident(id)?.filter(Incident::is_open),
            None => None,
        };
        info!(
            service = %self.spec.id,
            state = %record.state,
            incident = ?record.open_incident,
            version = record.version,
            "service state restored"
        );
        self.record = record;
        self.incident = incident;
        self.ctx.monitor.store_ok().await;

        self.reconcile_notifications().await
    }

    /// Dispatch lifecycle notifications the last run committed but never
    /// recorded. Dedup keys make this a no-op when nothing was lost.
    async fn reconcile_notifications(&mut self) -> StateResult<()> {
        let mut due: Vec<(NotificationKind, Incident)> = Vec::new();
        if let Some(incident) = &self.incident {
            // Escalation raised the severity after the opened alert went
            // out, so an escalated incident only replays its escalation.
            let kind = if incident.state == IncidentState::Escalated {
                NotificationKind::Escalated
            } else {
                NotificationKind::Opened
            };
            due.push((kind, incident.clone()));
        } else if let Some(last) = self.record.last_incident_id() {
            if let Some(incident) = self.ctx.store.get_incident(&last)? {
                if !incident.is_open() {
                    due.push((NotificationKind::Resolved, incident));
                }
            }
        }

        for (kind, incident) in due {
            let outcome = self
                .ctx
                .dispatcher
                .dispatch(&self.spec.escalation, kind, &incident)
                .await?;
            if outcome != DispatchOutcome::Suppressed {
                info!(service = %self.spec.id, incident = %incident.id, %kind, "replayed missed notification");
                self.count_dispatch(&outcome);
            }
        }
        Ok(())
    }

    // ── Inputs ────────────────────────────────────────────────────

    async fn handle(&mut self, input: PipelineInput) -> Flow {
        match input {
            PipelineInput::Check(result) => {
                self.ctx.metrics.record_check(&result.outcome);
                debug!(
                    service = %self.spec.id,
                    outcome = ?result.outcome,
                    latency_ms = result.latency_ms,
                    "check result"
                );
                self.process(MachineInput::Check(result)).await
            }
            PipelineInput::External(event) => {
                info!(
                    service = %self.spec.id,
                    severity = %event.severity,
                    cause = %event.cause,
                    "external event"
                );
                self.process(MachineInput::External(event)).await
            }
            PipelineInput::RecoveryFinished {
                incident_id,
                attempt_number,
                result,
            } => self.recovery_finished(&incident_id, attempt_number, result).await,
            PipelineInput::Reload(spec) => {
                info!(service = %spec.id, "service configuration reloaded");
                self.spec = spec;
                Flow::Continue
            }
        }
    }

    async fn recovery_finished(
        &mut self,
        incident_id: &str,
        attempt_number: u32,
        result: StateResult<RecoveryReport>,
    ) -> Flow {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.matches(incident_id, attempt_number))
        {
            self.in_flight = None;
        }
        match result {
            Ok(report) => {
                self.ctx.metrics.recovery_set(report.succeeded);
                self.process(MachineInput::Recovery(report)).await
            }
            // The set was cut short; attempts_made did not advance, so the
            // same set runs again once the store answers.
            Err(e) => {
                if self.store_failed(&e).await {
                    Flow::Continue
                } else {
                    Flow::Halted
                }
            }
        }
    }

    /// Apply, commit, then dispatch.
    ///
    /// A failed commit changes nothing, so the whole input is re-applied
    /// after the pause. Dispatch is retried per event; dedup keys make the
    /// retry safe.
    async fn process(&mut self, input: MachineInput) -> Flow {
        let step = loop {
            let now = self.ctx.clock.now_millis();
            let step = HealthMachine::new(&self.spec, self.ctx.settings.history).apply(
                &self.record,
                self.incident.as_ref(),
                &input,
                now,
            );
            match self
                .ctx
                .store
                .commit_transition(&step.record, step.incident.as_ref())
            {
                Ok(stored) => {
                    self.ctx.monitor.store_ok().await;
                    break Step {
                        record: stored,
                        ..step
                    };
                }
                Err(StateError::Conflict { expected, found, .. }) => {
                    warn!(service = %self.spec.id, expected, found, "stale service record, reloading");
                    if let Err(e) = self.refresh() {
                        if !self.store_failed(&e).await {
                            return Flow::Halted;
                        }
                    }
                }
                Err(e) => {
                    if !self.store_failed(&e).await {
                        return Flow::Halted;
                    }
                }
            }
        };

        self.adopt(&step);
        self.dispatch_events(step.events).await
    }

    /// Take a committed step as the pipeline's view of the service.
    fn adopt(&mut self, step: &Step) {
        for t in &step.transitions {
            info!(
                service = %self.spec.id,
                from = %t.from,
                to = %t.to,
                incident = ?step.record.open_incident,
                "state transition"
            );
        }
        self.ctx.metrics.record_transitions(step.transitions.len());
        for event in &step.events {
            match event.kind {
                NotificationKind::Opened => self.ctx.metrics.incident_opened(),
                NotificationKind::Escalated => self.ctx.metrics.incident_escalated(),
                NotificationKind::Resolved => self.ctx.metrics.incident_resolved(),
            }
        }

        self.record = step.record.clone();
        if let Some(incident) = &step.incident {
            self.incident = incident.is_open().then(|| incident.clone());
        }
        if self.record.open_incident.is_none() {
            self.incident = None;
        }
    }

    async fn dispatch_events(&mut self, events: Vec<IncidentEvent>) -> Flow {
        for event in events {
            loop {
                match self
                    .ctx
                    .dispatcher
                    .dispatch(&self.spec.escalation, event.kind, &event.incident)
                    .await
                {
                    Ok(outcome) => {
                        self.count_dispatch(&outcome);
                        break;
                    }
                    Err(e) if e.is_persistence_failure() => {
                        if !self.store_failed(&e).await {
                            return Flow::Halted;
                        }
                    }
                    Err(e) => {
                        warn!(
                            service = %self.spec.id,
                            incident = %event.incident.id,
                            kind = %event.kind,
                            error = %e,
                            "notification dropped"
                        );
                        break;
                    }
                }
            }
        }
        Flow::Continue
    }

    fn count_dispatch(&self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered { .. } => self.ctx.metrics.notification_delivered(),
            DispatchOutcome::Failed { .. } => self.ctx.metrics.notification_failed(),
            DispatchOutcome::Suppressed => self.ctx.metrics.notification_suppressed(),
            DispatchOutcome::Unroutable => {}
        }
    }

    /// Re-read the record and open incident from the store.
    fn refresh(&mut self) -> StateResult<()> {
        let now = self.ctx.clock.now_millis();
        self.record = self.ctx.store.load_or_init_service(&self.spec.id, now)?;
        self.incident = match self.record.open_incident.as_deref() {
            Some(id) => self.ctx.store.get_incident(id)?.filter(Incident::is_open),
            None => None,
        };
        Ok(())
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// When the next attempt set becomes due, if one is pending.
    fn recovery_deadline(&self) -> Option<Instant> {
        if self.in_flight.is_some() || self.record.state != ServiceState::Recovering {
            return None;
        }
        self.record
            .recovery
            .as_ref()
            .map(|p| self.ctx.clock.deadline(p.next_eligible_at))
    }

    async fn evaluate_recovery(&mut self) -> Flow {
        if self.in_flight.is_some() || self.record.state != ServiceState::Recovering {
            return Flow::Continue;
        }
        let Some(progress) = self.record.recovery.clone() else {
            return Flow::Continue;
        };

        let next = if self.spec.recovery.is_enabled() {
            next_attempt(&self.spec.recovery, &progress, self.ctx.clock.now_millis())
        } else {
            NextAttempt::Exhausted
        };
        match next {
            NextAttempt::WaitUntil(at) => {
                debug!(service = %self.spec.id, next_eligible_at = at, "recovery backing off");
                Flow::Continue
            }
            NextAttempt::Run { attempt_number } => {
                self.spawn_recovery(progress.incident_id, attempt_number);
                Flow::Continue
            }
            NextAttempt::Exhausted => self.process(MachineInput::RecoveryExhausted).await,
        }
    }

    fn spawn_recovery(&mut self, incident_id: String, attempt_number: u32) {
        let executor = self.ctx.executor.clone();
        let spec = self.spec.clone();
        let tx = self.report_tx.clone();
        let id = incident_id.clone();
        let handle = tokio::spawn(async move {
            let result = executor.run_attempt_set(&spec, &id, attempt_number).await;
            let _ = tx
                .send(PipelineInput::RecoveryFinished {
                    incident_id: id,
                    attempt_number,
                    result,
                })
                .await;
        });
        self.in_flight = Some(InFlight {
            incident_id,
            attempt_number,
            handle,
        });
    }

    // ── Store failures ────────────────────────────────────────────

    /// Report a store failure and wait before the retry.
    ///
    /// Returns `false` if stop was requested in the meantime.
    async fn store_failed(&mut self, err: &StateError) -> bool {
        self.ctx.monitor.store_failed(&self.spec.id, err).await;
        self.pause(self.ctx.settings.store_retry).await
    }

    async fn pause(&mut self, delay: Duration) -> bool {
        if self.stop_requested() {
            return false;
        }
        tokio::select! {
            _ = self.stop_rx.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────

    /// Give an in-flight attempt set the grace period to finish; otherwise
    /// abandon it and mark the record `pending`.
    async fn shutdown(&mut self, rx: &mut mpsc::Receiver<PipelineInput>) {
        if let Some(in_flight) = self.in_flight.take() {
            let grace = self.ctx.settings.shutdown_grace;
            let finished = tokio::time::timeout(grace, async {
                while let Some(input) = rx.recv().await {
                    if let PipelineInput::RecoveryFinished {
                        incident_id,
                        attempt_number,
                        result,
                    } = input
                    {
                        if in_flight.matches(&incident_id, attempt_number) {
                            return Some(result);
                        }
                    }
                }
                None
            })
            .await;

            match finished {
                Ok(Some(Ok(report))) => {
                    self.ctx.metrics.recovery_set(report.succeeded);
                    self.process(MachineInput::Recovery(report)).await;
                }
                _ => {
                    in_flight.handle.abort();
                    self.mark_pending();
                }
            }
        }
        info!(service = %self.spec.id, state = %self.record.state, "pipeline stopped");
    }

    fn mark_pending(&mut self) {
        let mut record = self.record.clone();
        record.pending = true;
        record.updated_at = self.ctx.clock.now_millis();
        match self.ctx.store.commit_transition(&record, None) {
            Ok(stored) => {
                warn!(
                    service = %self.spec.id,
                    incident = ?stored.open_incident,
                    "recovery abandoned at shutdown, marked pending"
                );
                self.record = stored;
            }
            Err(e) => {
                error!(service = %self.spec.id, error = %e, "could not mark abandoned recovery");
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
