//! Alert messages and their webhook payload.

use serde::Serialize;
use serde_json::{json, Value};

use vigil_core::Severity;
use vigil_state::{Incident, NotificationKind};

/// What an alert announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Opened,
    Escalated,
    Resolved,
    /// The engine lost its state store.
    EngineDegraded,
    /// The state store answers again.
    EngineRecovered,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::EngineDegraded => "engine_degraded",
            Self::EngineRecovered => "engine_recovered",
        }
    }

    /// Attachment colour.
    pub fn color(&self) -> &'static str {
        match self {
            Self::Opened | Self::EngineDegraded => "#FF0000",
            Self::Escalated => "#FF6600",
            Self::Resolved | Self::EngineRecovered => "#00CC00",
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            Self::Opened => "DOWN",
            Self::Escalated => "ESCALATED",
            Self::Resolved => "RECOVERED",
            Self::EngineDegraded => "ENGINE DEGRADED",
            Self::EngineRecovered => "ENGINE RECOVERED",
        }
    }
}

impl From<NotificationKind> for AlertKind {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Opened => Self::Opened,
            NotificationKind::Escalated => Self::Escalated,
            NotificationKind::Resolved => Self::Resolved,
        }
    }
}

/// One outbound alert, independent of transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMessage {
    pub kind: AlertKind,
    /// Empty for engine alerts.
    pub incident_id: String,
    pub service_id: String,
    pub severity: Severity,
    pub state: String,
    pub cause: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl AlertMessage {
    /// Alert for an incident lifecycle event.
    pub fn for_incident(kind: NotificationKind, incident: &Incident, timestamp: u64) -> Self {
        Self {
            kind: kind.into(),
            incident_id: incident.id.clone(),
            service_id: incident.service_id.clone(),
            severity: incident.severity,
            state: incident.state.to_string(),
            cause: incident.cause.clone(),
            timestamp,
        }
    }

    /// Self-monitoring alert about the engine itself.
    pub fn engine(kind: AlertKind, detail: impl Into<String>, timestamp: u64) -> Self {
        let severity = if kind == AlertKind::EngineDegraded {
            Severity::Critical
        } else {
            Severity::Minor
        };
        Self {
            kind,
            incident_id: String::new(),
            service_id: "vigil".to_string(),
            severity,
            state: kind.as_str().to_string(),
            cause: detail.into(),
            timestamp,
        }
    }

    pub fn title(&self) -> String {
        format!("{}: {}", self.service_id, self.kind.headline())
    }

    pub fn text(&self) -> String {
        let detail = match self.kind {
            AlertKind::Opened => format!("Error: {}", self.cause),
            AlertKind::Escalated => {
                format!("Automated recovery failed, please investigate manually. Cause: {}", self.cause)
            }
            AlertKind::Resolved => "Service has recovered".to_string(),
            AlertKind::EngineDegraded | AlertKind::EngineRecovered => self.cause.clone(),
        };
        if self.incident_id.is_empty() {
            detail
        } else {
            format!("[{}] {} ({} severity)", self.incident_id, detail, self.severity)
        }
    }

    /// Chat-attachment webhook body.
    pub fn webhook_payload(&self) -> Value {
        json!({
            "attachments": [{
                "color": self.kind.color(),
                "title": self.title(),
                "text": self.text(),
                "fields": [
                    { "title": "Severity", "value": self.severity.as_str(), "short": true },
                    { "title": "State", "value": self.state, "short": true },
                    { "title": "Time", "value": format_time(self.timestamp), "short": true },
                ],
                "ts": self.timestamp / 1000,
            }]
        })
    }
}

/// `YYYY-MM-DD HH:MM:SS UTC` for an epoch-millisecond timestamp.
pub fn format_time(timestamp_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
