//! Escalation and notification dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use vigil_core::{Clock, EscalationPolicy, NotifySettings};
use vigil_state::{
    dedup_key, DeliveryState, Incident, NotificationKind, NotificationRecord, StateResult,
    StateStore,
};

use crate::channel::Notifier;
use crate::message::{AlertKind, AlertMessage};
use crate::pacer::Pacer;

/// Delivery knobs, usually taken from `[notify]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Channel used when a service has no escalation mapping.
    pub default_channel: Option<String>,
    /// Channel for engine self-monitoring alerts.
    pub engine_channel: Option<String>,
    /// Extra send attempts after the first failure.
    pub retries: u32,
    /// Delay before the first retry; doubles per retry.
    pub retry_backoff: Duration,
    pub min_interval: Duration,
}

impl From<&NotifySettings> for DispatcherConfig {
    fn from(settings: &NotifySettings) -> Self {
        Self {
            default_channel: settings.default_channel.clone(),
            engine_channel: settings.engine_channel.clone(),
            retries: settings.retries,
            retry_backoff: settings.retry_backoff,
            min_interval: settings.min_interval,
        }
    }
}

/// What happened to one lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { channel: String },
    /// Dedup key already recorded; nothing sent.
    Suppressed,
    /// Recorded, but every send attempt failed.
    Failed { channel: String },
    /// No channel configured for the service or as default.
    Unroutable,
}

/// Deduplicates, persists and delivers incident notifications.
pub struct Dispatcher {
    store: StateStore,
    notifier: Arc<dyn Notifier>,
    pacer: Pacer,
    config: DispatcherConfig,
    clock: Clock,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        notifier: Arc<dyn Notifier>,
        config: DispatcherConfig,
        clock: Clock,
    ) -> Self {
        Self {
            pacer: Pacer::new(config.min_interval),
            store,
            notifier,
            config,
            clock,
        }
    }

    /// Channel for an event: escalations go to the most urgent mapping,
    /// everything else follows the incident severity.
    pub fn route(
        &self,
        policy: &EscalationPolicy,
        kind: NotificationKind,
        incident: &Incident,
    ) -> Option<String> {
        let mapped = match kind {
            NotificationKind::Escalated => policy.highest_channel(),
            NotificationKind::Opened | NotificationKind::Resolved => {
                policy.channel_for(incident.severity)
            }
        };
        mapped
            .map(str::to_string)
            .or_else(|| self.config.default_channel.clone())
    }

    /// Notify about one lifecycle event of `incident`.
    ///
    /// Store errors are returned (the caller retries the event); delivery
    /// errors are logged and reported as `Failed`, never returned.
    pub async fn dispatch(
        &self,
        policy: &EscalationPolicy,
        kind: NotificationKind,
        incident: &Incident,
    ) -> StateResult<DispatchOutcome> {
        let key = dedup_key(&incident.id, incident.severity, kind);
        if self.store.has_notification(&key)? {
            debug!(incident = %incident.id, %key, "notification suppressed");
            return Ok(DispatchOutcome::Suppressed);
        }

        let Some(channel) = self.route(policy, kind, incident) else {
            warn!(incident = %incident.id, %kind, "no channel configured for notification");
            return Ok(DispatchOutcome::Unroutable);
        };

        let now = self.clock.now_millis();
        let record = NotificationRecord {
            incident_id: incident.id.clone(),
            dedup_key: key,
            kind,
            severity: incident.severity,
            channel: channel.clone(),
            sent_at: now,
            delivery: DeliveryState::Pending,
        };
        // Persist before sending.
        if !self.store.record_notification(&record)? {
            debug!(incident = %incident.id, key = %record.dedup_key, "notification suppressed");
            return Ok(DispatchOutcome::Suppressed);
        }

        let message = AlertMessage::for_incident(kind, incident, now);
        self.deliver(record, &message).await
    }

    /// Re-send notifications persisted but never confirmed (crash between
    /// write and send). Returns how many were delivered.
    pub async fn resend_pending(&self) -> StateResult<usize> {
        let pending = self.store.pending_notifications()?;
        if !pending.is_empty() {
            info!(count = pending.len(), "re-sending pending notifications");
        }
        let mut delivered = 0;
        for record in pending {
            let Some(incident) = self.store.get_incident(&record.incident_id)? else {
                continue;
            };
            let mut message = AlertMessage::for_incident(record.kind, &incident, record.sent_at);
            message.severity = record.severity;
            if matches!(self.deliver(record, &message).await?, DispatchOutcome::Delivered { .. }) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn deliver(
        &self,
        record: NotificationRecord,
        message: &AlertMessage,
    ) -> StateResult<DispatchOutcome> {
        let channel = record.channel.clone();
        let delivery = if self.send_with_retries(&channel, message).await {
            info!(
                incident = %record.incident_id,
                kind = %record.kind,
                severity = %record.severity,
                %channel,
                "notification delivered"
            );
            DeliveryState::Delivered
        } else {
            error!(
                incident = %record.incident_id,
                kind = %record.kind,
                %channel,
                "notification delivery failed"
            );
            DeliveryState::Failed
        };

        self.store
            .set_delivery(&record.incident_id, &record.dedup_key, delivery)?;

        Ok(match delivery {
            DeliveryState::Delivered => DispatchOutcome::Delivered { channel },
            _ => DispatchOutcome::Failed { channel },
        })
    }

    /// Send a self-monitoring alert straight to the engine channel.
    ///
    /// Never touches the store: these alerts report that the store is gone.
    pub async fn send_engine_alert(&self, kind: AlertKind, detail: &str) -> bool {
        let Some(channel) = self
            .config
            .engine_channel
            .clone()
            .or_else(|| self.config.default_channel.clone())
        else {
            warn!(kind = kind.as_str(), %detail, "no engine channel configured");
            return false;
        };
        let message = AlertMessage::engine(kind, detail, self.clock.now_millis());
        self.send_with_retries(&channel, &message).await
    }

    async fn send_with_retries(&self, channel: &str, message: &AlertMessage) -> bool {
        let mut backoff = self.config.retry_backoff;
        for attempt in 0..=self.config.retries {
            self.pacer.wait(channel).await;
            match self.notifier.send(channel, message).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(%channel, attempt = attempt + 1, error = %e, "notification send failed");
                    if attempt < self.config.retries {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        false
    }
}
