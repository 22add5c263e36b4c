//! Recovery executor.
//!
//! Runs one attempt set for an incident and records every action as an
//! append-only `RecoveryAttempt`. Sets for the same service never overlap:
//! each service has its own async mutex, held for the whole set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use vigil_core::{Clock, RecoveryActionSpec, ServiceSpec};
use vigil_state::{ActionOutcome, RecoveryAttempt, RecoveryReport, StateResult, StateStore};

use crate::runner::ActionRunner;

/// Executes recovery attempt sets, serialized per service.
pub struct RecoveryExecutor {
    store: StateStore,
    runner: Arc<dyn ActionRunner>,
    clock: Clock,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecoveryExecutor {
    pub fn new(store: StateStore, runner: Arc<dyn ActionRunner>, clock: Clock) -> Self {
        Self {
            store,
            runner,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, service_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(service_id.to_string()).or_default().clone()
    }

    #[cfg(test)]
    fn is_busy(&self, service_id: &str) -> bool {
        self.lock_for(service_id).try_lock().is_err()
    }

    /// Run attempt set `attempt_number` for `incident_id`.
    ///
    /// Actions run in order; the first failure ends the set. A store error
    /// while recording an attempt aborts the set and is returned as is.
    pub async fn run_attempt_set(
        &self,
        spec: &ServiceSpec,
        incident_id: &str,
        attempt_number: u32,
    ) -> StateResult<RecoveryReport> {
        let lock = self.lock_for(&spec.id);
        let _guard = lock.lock().await;

        info!(
            service = %spec.id,
            incident = %incident_id,
            attempt = attempt_number,
            max = spec.recovery.max_attempts,
            actions = spec.recovery.actions.len(),
            "recovery attempt set starting"
        );

        let mut succeeded = true;
        for action in &spec.recovery.actions {
            let attempt = self
                .run_action(spec, action, incident_id, attempt_number)
                .await;
            let ok = attempt.outcome.is_success();
            self.store.append_recovery_attempt(&attempt)?;
            if !ok {
                warn!(
                    service = %spec.id,
                    incident = %incident_id,
                    attempt = attempt_number,
                    action = %action.name,
                    outcome = ?attempt.outcome,
                    "recovery action failed"
                );
                succeeded = false;
                break;
            }
        }

        let exhausted = !succeeded && attempt_number >= spec.recovery.max_attempts;
        info!(
            service = %spec.id,
            incident = %incident_id,
            attempt = attempt_number,
            succeeded,
            exhausted,
            "recovery attempt set finished"
        );

        Ok(RecoveryReport {
            incident_id: incident_id.to_string(),
            attempt_number,
            succeeded,
            exhausted,
        })
    }

    async fn run_action(
        &self,
        spec: &ServiceSpec,
        action: &RecoveryActionSpec,
        incident_id: &str,
        attempt_number: u32,
    ) -> RecoveryAttempt {
        let started_at = self.clock.now_millis();
        let timeout = spec.recovery.action_timeout;
        let runner = self.runner.clone();
        let task_action = action.action.clone();

        // Own task so a panicking runner only fails this action. Dropping
        // the set aborts it, on timeout or when the whole set is abandoned.
        let mut task = JoinSet::new();
        task.spawn(async move { runner.execute(&task_action, timeout).await });
        let outcome = match tokio::time::timeout(timeout, task.join_next()).await {
            Ok(Some(Ok(outcome))) => outcome,
            Ok(Some(Err(e))) => ActionOutcome::failure(format!("action crashed: {e}")),
            Ok(None) => ActionOutcome::failure("action task missing"),
            Err(_) => ActionOutcome::Timeout,
        };

        debug!(service = %spec.id, action = %action.name, ?outcome, "recovery action complete");

        RecoveryAttempt {
            incident_id: incident_id.to_string(),
            attempt_number,
            action: action.name.clone(),
            started_at,
            finished_at: self.clock.now_millis(),
            outcome,
        }
    }
}
