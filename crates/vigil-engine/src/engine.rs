//! Engine lifecycle.
//!
//! The engine owns one pipeline per configured service plus the probe
//! scheduler feeding them. Services share nothing but the store, the
//! metrics registry, the dispatcher and the recovery executor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vigil_core::{Clock, ServiceSpec, Settings};
use vigil_health::{CheckCallback, CheckFuture, ExternalEvent, Probe, ProbeScheduler, StandardProbe};
use vigil_metrics::{render_prometheus, EngineMetrics, MetricsSnapshot};
use vigil_notify::{ChannelRouter, Dispatcher, DispatcherConfig, Notifier};
use vigil_recovery::{ActionRunner, RecoveryExecutor, StandardRunner};
use vigil_state::StateStore;

use crate::error::{EngineError, EngineResult};
use crate::pipeline::{EngineContext, PipelineHandle, PipelineInput};
use crate::self_monitor::SelfMonitor;

/// File name of the state database inside `data_dir`.
pub const STATE_FILE: &str = "vigil.redb";

struct ServiceSlot {
    spec: Arc<ServiceSpec>,
    pipeline: Option<PipelineHandle>,
}

/// What a configuration reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Builds an [`Engine`], substituting capabilities where given.
pub struct EngineBuilder {
    settings: Settings,
    store: Option<StateStore>,
    probe: Option<Arc<dyn Probe>>,
    runner: Option<Arc<dyn ActionRunner>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Clock>,
}

impl EngineBuilder {
    pub fn store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ActionRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Open the store under `data_dir` unless one was supplied, and wire
    /// the shared components. Nothing runs until [`Engine::start`].
    pub fn build(self) -> EngineResult<Engine> {
        let Settings {
            engine,
            notify,
            services,
        } = self.settings;

        let store = match self.store {
            Some(store) => store,
            None => {
                std::fs::create_dir_all(&engine.data_dir).map_err(|source| {
                    EngineError::DataDir {
                        path: engine.data_dir.clone(),
                        source,
                    }
                })?;
                StateStore::open(&engine.data_dir.join(STATE_FILE))?
            }
        };
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(ChannelRouter::new(&notify.channels, notify.send_timeout)?),
        };
        let probe = self.probe.unwrap_or_else(|| Arc::new(StandardProbe));
        let runner = self.runner.unwrap_or_else(|| Arc::new(StandardRunner));
        let clock = self.clock.unwrap_or_default();

        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            notifier,
            DispatcherConfig::from(&notify),
            clock,
        ));
        let executor = Arc::new(RecoveryExecutor::new(store.clone(), runner, clock));
        let ctx = Arc::new(EngineContext {
            monitor: SelfMonitor::new(metrics.clone(), dispatcher.clone()),
            store,
            clock,
            metrics,
            dispatcher,
            executor,
            settings: engine,
        });

        let slots = services
            .into_iter()
            .map(|spec| {
                (
                    spec.id.clone(),
                    ServiceSlot {
                        spec: Arc::new(spec),
                        pipeline: None,
                    },
                )
            })
            .collect();

        Ok(Engine {
            scheduler: ProbeScheduler::new(probe, clock),
            ctx,
            services: RwLock::new(slots),
            started: AtomicBool::new(false),
        })
    }
}

/// The monitoring and auto-recovery engine.
pub struct Engine {
    ctx: Arc<EngineContext>,
    scheduler: ProbeScheduler,
    services: RwLock<BTreeMap<String, ServiceSlot>>,
    started: AtomicBool,
}

impl Engine {
    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder {
            settings,
            store: None,
            probe: None,
            runner: None,
            notifier: None,
            clock: None,
        }
    }

    /// Re-send interrupted notifications, then start every pipeline and
    /// probe loop.
    pub async fn start(&self) -> EngineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        match self.ctx.dispatcher.resend_pending().await {
            Ok(0) => {}
            Ok(n) => info!(delivered = n, "pending notifications re-sent"),
            // Left pending; the next start tries again.
            Err(e) => self.ctx.monitor.store_failed("engine", &e).await,
        }

        let mut services = self.services.write().await;
        for slot in services.values_mut() {
            self.launch(slot).await;
        }
        info!(services = services.len(), "engine started");
        Ok(())
    }

    async fn launch(&self, slot: &mut ServiceSlot) {
        let pipeline = PipelineHandle::spawn(self.ctx.clone(), slot.spec.clone());
        self.scheduler
            .start(slot.spec.clone(), check_callback(pipeline.tx.clone()))
            .await;
        slot.pipeline = Some(pipeline);
    }

    /// Feed an externally detected incident into the service's pipeline.
    pub async fn ingest(&self, event: ExternalEvent) -> EngineResult<()> {
        let services = self.services.read().await;
        let slot = services
            .get(&event.service_id)
            .ok_or_else(|| EngineError::UnknownService(event.service_id.clone()))?;
        let pipeline = slot
            .pipeline
            .as_ref()
            .ok_or_else(|| EngineError::Stopped(event.service_id.clone()))?;
        let service_id = event.service_id.clone();
        pipeline
            .tx
            .send(PipelineInput::External(event))
            .await
            .map_err(|_| EngineError::Stopped(service_id))
    }

    /// Apply a new service list.
    ///
    /// Removed services stop, added ones start, changed ones keep their
    /// pipeline (and any open incident) and pick up the new definition.
    pub async fn reload(&self, settings: Settings) -> ReloadSummary {
        let running = self.started.load(Ordering::SeqCst);
        let mut summary = ReloadSummary::default();
        let mut services = self.services.write().await;

        let incoming: BTreeMap<String, ServiceSpec> = settings
            .services
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let gone: Vec<String> = services
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(slot) = services.remove(&id) {
                self.scheduler.stop(&id).await;
                if let Some(pipeline) = slot.pipeline {
                    pipeline.stop().await;
                }
            }
            summary.removed.push(id);
        }

        for (id, spec) in incoming {
            match services.get_mut(&id) {
                Some(slot) if *slot.spec == spec => {}
                Some(slot) => {
                    let spec = Arc::new(spec);
                    slot.spec = spec.clone();
                    if let Some(pipeline) = &slot.pipeline {
                        if pipeline.tx.send(PipelineInput::Reload(spec.clone())).await.is_ok() {
                            self.scheduler
                                .start(spec, check_callback(pipeline.tx.clone()))
                                .await;
                        }
                    }
                    summary.updated.push(id);
                }
                None => {
                    let mut slot = ServiceSlot {
                        spec: Arc::new(spec),
                        pipeline: None,
                    };
                    if running {
                        self.launch(&mut slot).await;
                    }
                    services.insert(id.clone(), slot);
                    summary.added.push(id);
                }
            }
        }

        if summary.is_empty() {
            debug!("reload: no service changes");
        } else {
            info!(
                added = ?summary.added,
                removed = ?summary.removed,
                updated = ?summary.updated,
                "configuration reloaded"
            );
        }
        summary
    }

    /// Stop probing, then give every pipeline the grace period to finish
    /// in-flight recovery.
    pub async fn shutdown(&self) {
        self.scheduler.stop_all().await;

        let mut services = self.services.write().await;
        let pipelines: Vec<PipelineHandle> = services
            .values_mut()
            .filter_map(|slot| slot.pipeline.take())
            .collect();
        for pipeline in &pipelines {
            pipeline.signal_stop();
        }
        for pipeline in pipelines {
            pipeline.join().await;
        }
        self.started.store(false, Ordering::SeqCst);
        info!("engine stopped");
    }

    /// Configured services, ordered by id.
    pub async fn services(&self) -> Vec<Arc<ServiceSpec>> {
        let services = self.services.read().await;
        services.values().map(|s| s.spec.clone()).collect()
    }

    pub async fn service(&self, service_id: &str) -> Option<Arc<ServiceSpec>> {
        let services = self.services.read().await;
        services.get(service_id).map(|s| s.spec.clone())
    }

    pub fn store(&self) -> &StateStore {
        &self.ctx.store
    }

    pub fn clock(&self) -> Clock {
        self.ctx.clock
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Prometheus exposition of engine counters and per-service gauges.
    ///
    /// Counters are still rendered while the store is down.
    pub fn render_metrics(&self) -> String {
        let records = match self.ctx.store.list_services() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "metrics rendered without service records");
                Vec::new()
            }
        };
        render_prometheus(&self.ctx.metrics.snapshot(), &records)
    }

    /// Whether the state store is currently failing.
    pub fn is_degraded(&self) -> bool {
        self.ctx.monitor.is_degraded()
    }
}

fn check_callback(tx: tokio::sync::mpsc::Sender<PipelineInput>) -> CheckCallback {
    Arc::new(move |result| -> CheckFuture {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PipelineInput::Check(result)).await;
        })
    })
}
