//! Engine self-monitoring.
//!
//! Tracks whether the state store answers. The first failure flips the
//! engine to degraded and pages the engine channel; the first success
//! afterwards sends a recovery notice. These alerts go straight to the
//! notifier because the store is exactly what is broken.

use std::sync::Arc;

use tracing::{error, info};

use vigil_metrics::EngineMetrics;
use vigil_notify::{AlertKind, Dispatcher};
use vigil_state::StateError;

pub struct SelfMonitor {
    metrics: Arc<EngineMetrics>,
    dispatcher: Arc<Dispatcher>,
}

impl SelfMonitor {
    pub fn new(metrics: Arc<EngineMetrics>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            metrics,
            dispatcher,
        }
    }

    /// Record a failed store operation.
    pub async fn store_failed(&self, service_id: &str, err: &StateError) {
        self.metrics.store_error();
        error!(service = %service_id, error = %err, "state store operation failed");
        if !self.metrics.set_degraded(true) {
            let detail = format!("State store unavailable ({err}); affected services are halted until it answers");
            self.dispatcher
                .send_engine_alert(AlertKind::EngineDegraded, &detail)
                .await;
        }
    }

    /// Record a successful store operation.
    pub async fn store_ok(&self) {
        if self.metrics.is_degraded() && self.metrics.set_degraded(false) {
            info!("state store answering again");
            self.dispatcher
                .send_engine_alert(AlertKind::EngineRecovered, "State store answering again; monitoring resumed")
                .await;
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.metrics.is_degraded()
    }
}
