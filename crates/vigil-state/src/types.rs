//! Persisted domain types.
//!
//! Everything here is JSON-serialized into redb value columns. Timestamps
//! are epoch milliseconds.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use vigil_core::{IncidentId, ServiceId, Severity};

// ── Checks ────────────────────────────────────────────────────────

/// Outcome of one probe invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    Success,
    Failure { reason: String },
    Timeout,
}

impl CheckOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Human-readable description of a non-success outcome.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Failure { reason } => Some(reason),
            Self::Timeout => Some("probe timed out"),
        }
    }
}

/// A single completed (or timed-out) probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub service_id: ServiceId,
    pub timestamp: u64,
    pub outcome: CheckOutcome,
    pub latency_ms: u64,
}

// ── Service state ─────────────────────────────────────────────────

/// Health state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Unhealthy,
    Recovering,
    Escalated,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Recovering => "recovering",
            Self::Escalated => "escalated",
        }
    }

    /// States in which the service has an open incident.
    pub fn has_incident(&self) -> bool {
        matches!(self, Self::Unhealthy | Self::Recovering | Self::Escalated)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery bookkeeping for the open incident.
///
/// Persisted so a restart resumes backoff instead of restarting the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryProgress {
    pub incident_id: IncidentId,
    /// Attempt sets that have completed.
    pub attempts_made: u32,
    /// Earliest time the next attempt set may start.
    pub next_eligible_at: u64,
}

/// The durable per-service record owned by that service's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_id: ServiceId,
    pub state: ServiceState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub open_incident: Option<IncidentId>,
    /// Last incident sequence number handed out for this service.
    pub incident_seq: u64,
    pub recovery: Option<RecoveryProgress>,
    /// Set when in-flight work was abandoned at shutdown.
    #[serde(default)]
    pub pending: bool,
    pub recent_checks: VecDeque<CheckResult>,
    pub updated_at: u64,
    /// Compare-and-swap version; bumped by every committed write.
    pub version: u64,
}

impl ServiceRecord {
    /// Fresh record for a service never seen before (optimistic start).
    pub fn new(service_id: impl Into<String>, now: u64) -> Self {
        Self {
            service_id: service_id.into(),
            state: ServiceState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            open_incident: None,
            incident_seq: 0,
            recovery: None,
            pending: false,
            recent_checks: VecDeque::new(),
            updated_at: now,
            version: 0,
        }
    }

    /// Append a check result, keeping at most `limit` entries.
    pub fn push_check(&mut self, result: CheckResult, limit: usize) {
        self.recent_checks.push_back(result);
        while self.recent_checks.len() > limit.max(1) {
            self.recent_checks.pop_front();
        }
    }

    /// Mint the id for the next incident of this service.
    pub fn next_incident_id(&mut self) -> IncidentId {
        self.incident_seq += 1;
        format!("{}-{:05}", self.service_id, self.incident_seq)
    }

    /// Id of the most recently opened incident, if any.
    pub fn last_incident_id(&self) -> Option<IncidentId> {
        (self.incident_seq > 0).then(|| format!("{}-{:05}", self.service_id, self.incident_seq))
    }
}

// ── Incidents ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Recovering,
    Escalated,
    Resolved,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Recovering => "recovering",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What raised the incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSource {
    Probe,
    External,
}

/// One continuous unhealthy period of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub service_id: ServiceId,
    pub opened_at: u64,
    pub closed_at: Option<u64>,
    pub severity: Severity,
    pub state: IncidentState,
    pub cause: String,
    pub source: IncidentSource,
    #[serde(default)]
    pub attempts: Vec<RecoveryAttempt>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
}

impl Incident {
    pub fn open(
        id: IncidentId,
        service_id: impl Into<String>,
        severity: Severity,
        cause: impl Into<String>,
        source: IncidentSource,
        now: u64,
    ) -> Self {
        Self {
            id,
            service_id: service_id.into(),
            opened_at: now,
            closed_at: None,
            severity,
            state: IncidentState::Open,
            cause: cause.into(),
            source,
            attempts: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != IncidentState::Resolved
    }

    /// Whether a notification of this kind was already recorded.
    pub fn has_notification(&self, kind: NotificationKind) -> bool {
        self.notifications.iter().any(|n| n.kind == kind)
    }
}

// ── Recovery attempts ─────────────────────────────────────────────

/// Outcome of one recovery action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure { reason: String },
    Timeout,
}

impl ActionOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One executed recovery action. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub incident_id: IncidentId,
    /// Attempt set number, starting at 1.
    pub attempt_number: u32,
    pub action: String,
    pub started_at: u64,
    pub finished_at: u64,
    pub outcome: ActionOutcome,
}

/// Result of one complete attempt set, reported back to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub incident_id: IncidentId,
    pub attempt_number: u32,
    /// Every action in the set succeeded.
    pub succeeded: bool,
    /// The set failed and no attempts remain.
    pub exhausted: bool,
}

// ── Notifications ─────────────────────────────────────────────────

/// Incident lifecycle event a notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Opened,
    Escalated,
    Resolved,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery marker for a persisted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Persisted, send not yet confirmed.
    Pending,
    Delivered,
    /// Retries exhausted; never re-sent automatically.
    Failed,
}

/// A notification, recorded before it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub incident_id: IncidentId,
    pub dedup_key: String,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub channel: String,
    pub sent_at: u64,
    pub delivery: DeliveryState,
}

/// Dedup key for a notification: one send per (incident, severity, kind).
pub fn dedup_key(incident_id: &str, severity: Severity, kind: NotificationKind) -> String {
    format!("{incident_id}:{severity}:{kind}")
}
