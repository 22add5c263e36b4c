//! Static description of the monitored fleet.
//!
//! A `ServiceSpec` is built from `vigil.toml` at startup and stays
//! immutable for the run unless the configuration is explicitly reloaded.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unique identifier for a monitored service.
pub type ServiceId = String;

/// Unique identifier for an incident.
pub type IncidentId = String;

// ── Severity ──────────────────────────────────────────────────────

/// Incident severity, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }

    /// Map a log-scanner severity class onto an incident severity.
    ///
    /// Unknown classes return `None`; callers decide the fallback.
    pub fn from_log_class(class: &str) -> Option<Self> {
        match class.trim().to_ascii_lowercase().as_str() {
            "critical" | "fatal" | "panic" | "emergency" | "memory" | "disk_full" => {
                Some(Self::Critical)
            }
            "error" | "failure" | "db_connection" | "api_timeout" => Some(Self::Major),
            "warning" | "warn" => Some(Self::Minor),
            "minor" => Some(Self::Minor),
            "major" => Some(Self::Major),
            _ => None,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity {other:?}")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Probes ────────────────────────────────────────────────────────

/// How a service's health is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// GET `path` on `address` (ip:port); 2xx is healthy.
    Http { address: String, path: String },
    /// Open a TCP connection to `address`.
    Tcp { address: String },
    /// Run a command; exit status 0 is healthy.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ProbeSpec {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Tcp { .. } => "tcp",
            Self::Command { .. } => "command",
        }
    }
}

// ── Recovery ──────────────────────────────────────────────────────

/// A single remediation capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Run a command; exit status 0 is success.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// POST to `path` on `address`; 2xx is success.
    Http { address: String, path: String },
}

/// A named recovery action, as listed in a service's recovery sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryActionSpec {
    pub name: String,
    pub action: RecoveryAction,
}

/// Remediation policy for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Ordered actions forming one attempt set.
    pub actions: Vec<RecoveryActionSpec>,
    /// Attempt sets allowed per incident before escalating.
    pub max_attempts: u32,
    /// Upper bound for each action.
    pub action_timeout: Duration,
    /// Delay after the first failed set; doubles per set.
    pub backoff_base: Duration,
    /// Ceiling for the doubling delay.
    pub backoff_cap: Duration,
}

impl RecoveryPolicy {
    /// No automated remediation.
    pub fn disabled() -> Self {
        Self {
            actions: Vec::new(),
            max_attempts: 0,
            action_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.actions.is_empty() && self.max_attempts > 0
    }

    /// Delay before the next attempt set, given how many sets already ran.
    ///
    /// `base × 2^(attempts_made - 1)`, capped at `backoff_cap`.
    pub fn backoff_after(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempts_made - 1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap)
    }
}

// ── Escalation ────────────────────────────────────────────────────

/// Severity → notification channel mapping for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub channels: BTreeMap<Severity, String>,
}

impl EscalationPolicy {
    /// Channel for an incident of the given severity.
    ///
    /// Picks the mapping for the highest configured severity not above
    /// `severity`; below every mapping, the lowest configured one.
    pub fn channel_for(&self, severity: Severity) -> Option<&str> {
        self.channels
            .range(..=severity)
            .next_back()
            .or_else(|| self.channels.iter().next())
            .map(|(_, channel)| channel.as_str())
    }

    /// The channel mapped to the most urgent configured severity.
    pub fn highest_channel(&self) -> Option<&str> {
        self.channels
            .iter()
            .next_back()
            .map(|(_, channel)| channel.as_str())
    }
}

// ── Service ───────────────────────────────────────────────────────

/// Complete definition of one monitored service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub probe: ProbeSpec,
    /// Minimum spacing between probe starts.
    pub interval: Duration,
    /// Upper bound for a single probe.
    pub timeout: Duration,
    /// Consecutive failures that declare the service unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes that declare it recovered.
    pub success_threshold: u32,
    /// Severity of probe-driven incidents.
    pub severity: Severity,
    pub recovery: RecoveryPolicy,
    pub escalation: EscalationPolicy,
}

impl ServiceSpec {
    /// Minimal spec with default thresholds (for tests and tooling).
    pub fn new(id: impl Into<String>, probe: ProbeSpec) -> Self {
        Self {
            id: id.into(),
            probe,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 2,
            severity: Severity::Major,
            recovery: RecoveryPolicy::disabled(),
            escalation: EscalationPolicy::default(),
        }
    }
}
