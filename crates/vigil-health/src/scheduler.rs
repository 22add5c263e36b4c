//! Probe scheduler — one background task per monitored service.
//!
//! Each task runs its service's probe, hands the `CheckResult` to a
//! callback (normally the service pipeline's queue), and sleeps until
//! `interval` after the probe *started*. Services never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use vigil_core::{Clock, ServiceSpec};
use vigil_state::CheckResult;

use crate::probe::{run_check, Probe};

/// Callback receiving every check result of a service.
pub type CheckCallback = Arc<dyn Fn(CheckResult) -> CheckFuture + Send + Sync>;

/// Future returned by a [`CheckCallback`].
pub type CheckFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Per-service probe task.
struct ProbeSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Runs the probe loops for every monitored service.
pub struct ProbeScheduler {
    probe: Arc<dyn Probe>,
    clock: Clock,
    /// Active probe loops: service_id → slot.
    tasks: Arc<RwLock<HashMap<String, ProbeSlot>>>,
}

impl ProbeScheduler {
    pub fn new(probe: Arc<dyn Probe>, clock: Clock) -> Self {
        Self {
            probe,
            clock,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing a service, replacing any loop already running for it.
    pub async fn start(&self, spec: Arc<ServiceSpec>, callback: CheckCallback) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service_id = spec.id.clone();
        let interval = spec.interval;
        let probe = self.probe.clone();
        let clock = self.clock;

        let handle = tokio::spawn(async move {
            run_probe_loop(spec, probe, clock, callback, shutdown_rx).await;
        });

        let mut tasks = self.tasks.write().await;
        if let Some(old) = tasks.insert(
            service_id.clone(),
            ProbeSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(service = %service_id, ?interval, "probe loop started");
    }

    /// Stop probing a service.
    pub async fn stop(&self, service_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(slot) = tasks.remove(service_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(service = %service_id, "probe loop stopped");
        }
    }

    /// Stop every probe loop (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.write().await;
        for (id, slot) in tasks.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(service = %id, "probe loop stopped");
        }
        info!("all probe loops stopped");
    }

    /// Service ids with a running probe loop.
    pub async fn active(&self) -> Vec<String> {
        let tasks = self.tasks.read().await;
        tasks.keys().cloned().collect()
    }

    pub async fn is_running(&self, service_id: &str) -> bool {
        let tasks = self.tasks.read().await;
        tasks.contains_key(service_id)
    }
}

/// The probe loop for a single service.
async fn run_probe_loop(
    spec: Arc<ServiceSpec>,
    probe: Arc<dyn Probe>,
    clock: Clock,
    callback: CheckCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(service = %spec.id, kind = spec.probe.kind(), "probe loop starting");

    loop {
        let started = Instant::now();

        tokio::select! {
            result = run_check(probe.clone(), spec.clone(), &clock) => {
                callback(result).await;
            }
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + spec.interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(service = %spec.id, "probe loop shutting down");
}
