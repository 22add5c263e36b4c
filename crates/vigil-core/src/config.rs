//! vigil.toml configuration parser.
//!
//! `VigilConfig` mirrors the file layout (everything optional, durations as
//! strings). `VigilConfig::resolve` validates it and produces `Settings`,
//! the typed form the engine runs on.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::types::*;

// ── File layout ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: Option<String>,
    /// Check results retained per service.
    pub history: Option<usize>,
    pub shutdown_grace: Option<String>,
    /// Delay between retries while the state store is unreachable.
    pub store_retry: Option<String>,
    /// Per-service pipeline queue depth.
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub default_channel: Option<String>,
    /// Channel for engine self-monitoring alerts.
    pub engine_channel: Option<String>,
    pub retries: Option<u32>,
    pub retry_backoff: Option<String>,
    pub send_timeout: Option<String>,
    /// Minimum spacing between two sends on the same channel.
    pub min_interval: Option<String>,
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(flatten)]
    pub sink: ChannelSink,
}

/// Where a notification channel delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelSink {
    /// Chat webhook receiving attachment-style JSON payloads.
    Webhook { url: String },
    /// Structured log line only.
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub probe: ProbeSpec,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub severity: Option<String>,
    pub recovery: Option<RecoveryConfig>,
    /// Severity name → channel name.
    #[serde(default)]
    pub escalation: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub max_attempts: Option<u32>,
    pub action_timeout: Option<String>,
    pub backoff_base: Option<String>,
    pub backoff_cap: Option<String>,
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: Option<String>,
    #[serde(flatten)]
    pub action: RecoveryAction,
}

// ── Resolved settings ─────────────────────────────────────────────

/// A named, validated notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub sink: ChannelSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub history: usize,
    pub shutdown_grace: Duration,
    pub store_retry: Duration,
    pub queue_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/vigil"),
            history: 20,
            shutdown_grace: Duration::from_secs(10),
            store_retry: Duration::from_secs(1),
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySettings {
    pub default_channel: Option<String>,
    pub engine_channel: Option<String>,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub send_timeout: Duration,
    pub min_interval: Duration,
    pub channels: Vec<ChannelSpec>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            default_channel: None,
            engine_channel: None,
            retries: 3,
            retry_backoff: Duration::from_millis(500),
            send_timeout: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
            channels: Vec::new(),
        }
    }
}

/// Fully validated configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub engine: EngineSettings,
    pub notify: NotifySettings,
    pub services: Vec<ServiceSpec>,
}

impl VigilConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load and validate in one step.
    pub fn load(path: &Path) -> ConfigResult<Settings> {
        Self::from_file(path)?.resolve()
    }

    /// Validate the file contents and convert them to typed settings.
    pub fn resolve(&self) -> ConfigResult<Settings> {
        let engine = self.resolve_engine()?;
        let notify = self.resolve_notify()?;
        let known: HashSet<&str> = notify.channels.iter().map(|c| c.name.as_str()).collect();

        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(self.services.len());
        for svc in &self.services {
            if !seen.insert(svc.id.as_str()) {
                return Err(ConfigError::DuplicateService(svc.id.clone()));
            }
            let spec = svc.resolve()?;
            for channel in spec.escalation.channels.values() {
                if !known.contains(channel.as_str()) {
                    return Err(ConfigError::UnknownChannel {
                        channel: channel.clone(),
                        referenced_by: format!("service {}", spec.id),
                    });
                }
            }
            services.push(spec);
        }

        Ok(Settings {
            engine,
            notify,
            services,
        })
    }

    fn resolve_engine(&self) -> ConfigResult<EngineSettings> {
        let defaults = EngineSettings::default();
        let cfg = &self.engine;
        let history = cfg.history.unwrap_or(defaults.history);
        if history == 0 {
            return Err(ConfigError::Service {
                service: "engine".to_string(),
                reason: "history must be at least 1".to_string(),
            });
        }
        Ok(EngineSettings {
            data_dir: cfg
                .data_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            history,
            shutdown_grace: duration_or(
                "engine.shutdown_grace",
                cfg.shutdown_grace.as_deref(),
                defaults.shutdown_grace,
            )?,
            store_retry: duration_or(
                "engine.store_retry",
                cfg.store_retry.as_deref(),
                defaults.store_retry,
            )?,
            queue_depth: cfg.queue_depth.unwrap_or(defaults.queue_depth).max(1),
        })
    }

    fn resolve_notify(&self) -> ConfigResult<NotifySettings> {
        let defaults = NotifySettings::default();
        let cfg = &self.notify;

        let mut names = HashSet::new();
        let mut channels = Vec::with_capacity(cfg.channels.len());
        for ch in &cfg.channels {
            if ch.name.trim().is_empty() {
                return Err(ConfigError::Notify("channel name is empty".to_string()));
            }
            if !names.insert(ch.name.as_str()) {
                return Err(ConfigError::Notify(format!("duplicate channel {:?}", ch.name)));
            }
            if let ChannelSink::Webhook { url } = &ch.sink {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Notify(format!(
                        "channel {:?} has invalid webhook url {url:?}",
                        ch.name
                    )));
                }
            }
            channels.push(ChannelSpec {
                name: ch.name.clone(),
                sink: ch.sink.clone(),
            });
        }

        for (field, value) in [
            ("notify.default_channel", &cfg.default_channel),
            ("notify.engine_channel", &cfg.engine_channel),
        ] {
            if let Some(channel) = value {
                if !names.contains(channel.as_str()) {
                    return Err(ConfigError::UnknownChannel {
                        channel: channel.clone(),
                        referenced_by: field.to_string(),
                    });
                }
            }
        }

        Ok(NotifySettings {
            default_channel: cfg.default_channel.clone(),
            engine_channel: cfg
                .engine_channel
                .clone()
                .or_else(|| cfg.default_channel.clone()),
            retries: cfg.retries.unwrap_or(defaults.retries),
            retry_backoff: duration_or(
                "notify.retry_backoff",
                cfg.retry_backoff.as_deref(),
                defaults.retry_backoff,
            )?,
            send_timeout: duration_or(
                "notify.send_timeout",
                cfg.send_timeout.as_deref(),
                defaults.send_timeout,
            )?,
            min_interval: duration_or(
                "notify.min_interval",
                cfg.min_interval.as_deref(),
                defaults.min_interval,
            )?,
            channels,
        })
    }
}

impl ServiceConfig {
    fn resolve(&self) -> ConfigResult<ServiceSpec> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ConfigError::Service {
                service: self.id.clone(),
                reason: "id is empty".to_string(),
            });
        }
        let invalid = |reason: &str| ConfigError::Service {
            service: id.to_string(),
            reason: reason.to_string(),
        };

        let mut spec = ServiceSpec::new(id, self.probe.clone());
        let field = |name: &str| format!("service.{id}.{name}");

        spec.interval = duration_or(&field("interval"), self.interval.as_deref(), spec.interval)?;
        spec.timeout = duration_or(&field("timeout"), self.timeout.as_deref(), spec.timeout)?;
        if spec.interval.is_zero() {
            return Err(invalid("interval must be positive"));
        }
        if spec.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }

        spec.failure_threshold = self.failure_threshold.unwrap_or(spec.failure_threshold);
        spec.success_threshold = self.success_threshold.unwrap_or(spec.success_threshold);
        if spec.failure_threshold == 0 || spec.success_threshold == 0 {
            return Err(invalid("thresholds must be at least 1"));
        }

        if let Some(severity) = &self.severity {
            spec.severity = severity.parse().map_err(|e: String| invalid(&e))?;
        }

        for (severity, channel) in &self.escalation {
            let severity: Severity = severity.parse().map_err(|e: String| invalid(&e))?;
            spec.escalation.channels.insert(severity, channel.clone());
        }

        if let Some(recovery) = &self.recovery {
            spec.recovery = recovery.resolve(id)?;
        }

        Ok(spec)
    }
}

impl RecoveryConfig {
    fn resolve(&self, service: &str) -> ConfigResult<RecoveryPolicy> {
        let defaults = RecoveryPolicy::disabled();
        let field = |name: &str| format!("service.{service}.recovery.{name}");

        let actions = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| RecoveryActionSpec {
                name: a.name.clone().unwrap_or_else(|| default_action_name(i, &a.action)),
                action: a.action.clone(),
            })
            .collect::<Vec<_>>();

        let max_attempts = self
            .max_attempts
            .unwrap_or(if actions.is_empty() { 0 } else { 3 });

        let policy = RecoveryPolicy {
            actions,
            max_attempts,
            action_timeout: duration_or(
                &field("action_timeout"),
                self.action_timeout.as_deref(),
                defaults.action_timeout,
            )?,
            backoff_base: duration_or(
                &field("backoff_base"),
                self.backoff_base.as_deref(),
                defaults.backoff_base,
            )?,
            backoff_cap: duration_or(
                &field("backoff_cap"),
                self.backoff_cap.as_deref(),
                defaults.backoff_cap,
            )?,
        };
        if policy.action_timeout.is_zero() {
            return Err(ConfigError::Service {
                service: service.to_string(),
                reason: "recovery action_timeout must be positive".to_string(),
            });
        }
        Ok(policy)
    }
}

fn default_action_name(index: usize, action: &RecoveryAction) -> String {
    match action {
        RecoveryAction::Command { command, .. } => format!("{}-{command}", index + 1),
        RecoveryAction::Http { path, .. } => format!("{}-http{path}", index + 1),
    }
}

fn duration_or(field: &str, value: Option<&str>, default: Duration) -> ConfigResult<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::Duration {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[engine]
data_dir = "/tmp/vigil"
history = 50
shutdown_grace = "3s"

[notify]
default_channel = "ops"
engine_channel = "pager"
retries = 2
min_interval = "250ms"

[[notify.channel]]
name = "ops"
type = "webhook"
url = "https://hooks.example.com/services/T/B/X"

[[notify.channel]]
name = "pager"
type = "log"

[[service]]
id = "api"
interval = "10s"
timeout = "2s"
failure_threshold = 3
success_threshold = 2
severity = "major"
probe = { type = "http", address = "127.0.0.1:8000", path = "/health" }

[service.escalation]
major = "ops"
critical = "pager"

[service.recovery]
max_attempts = 2
backoff_base = "5s"
backoff_cap = "1m"

[[service.recovery.action]]
name = "restart"
type = "command"
command = "systemctl"
args = ["restart", "api"]

[[service]]
id = "redis"
probe = { type = "command", command = "redis-cli", args = ["ping"] }
"#;

    #[test]
    fn parse_minimal() {
        let settings = VigilConfig::parse("").unwrap().resolve().unwrap();
        assert!(settings.services.is_empty());
        assert_eq!(settings.engine, EngineSettings::default());
    }

    #[test]
    fn parse_full_config() {
        let settings = VigilConfig::parse(FULL).unwrap().resolve().unwrap();

        assert_eq!(settings.engine.data_dir, PathBuf::from("/tmp/vigil"));
        assert_eq!(settings.engine.history, 50);
        assert_eq!(settings.engine.shutdown_grace, Duration::from_secs(3));
        assert_eq!(settings.notify.retries, 2);
        assert_eq!(settings.notify.min_interval, Duration::from_millis(250));
        assert_eq!(settings.notify.engine_channel.as_deref(), Some("pager"));
        assert_eq!(settings.notify.channels.len(), 2);

        let api = &settings.services[0];
        assert_eq!(api.id, "api");
        assert_eq!(api.interval, Duration::from_secs(10));
        assert_eq!(api.severity, Severity::Major);
        assert_eq!(
            api.probe,
            ProbeSpec::Http {
                address: "127.0.0.1:8000".to_string(),
                path: "/health".to_string()
            }
        );
        assert_eq!(api.recovery.max_attempts, 2);
        assert_eq!(api.recovery.actions[0].name, "restart");
        assert_eq!(api.escalation.channel_for(Severity::Critical), Some("pager"));

        let redis = &settings.services[1];
        assert_eq!(redis.failure_threshold, 3);
        assert!(!redis.recovery.is_enabled());
    }

    #[test]
    fn engine_channel_defaults_to_default_channel() {
        let cfg = r#"
[notify]
default_channel = "ops"
[[notify.channel]]
name = "ops"
type = "log"
"#;
        let settings = VigilConfig::parse(cfg).unwrap().resolve().unwrap();
        assert_eq!(settings.notify.engine_channel.as_deref(), Some("ops"));
    }

    #[test]
    fn rejects_duplicate_services() {
        let cfg = r#"
[[service]]
id = "a"
probe = { type = "tcp", address = "127.0.0.1:1" }
[[service]]
id = "a"
probe = { type = "tcp", address = "127.0.0.1:2" }
"#;
        let err = VigilConfig::parse(cfg).unwrap().resolve().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateService(id) if id == "a"));
    }

    #[test]
    fn rejects_zero_thresholds() {
        let cfg = r#"
[[service]]
id = "a"
failure_threshold = 0
probe = { type = "tcp", address = "127.0.0.1:1" }
"#;
        let err = VigilConfig::parse(cfg).unwrap().resolve().unwrap_err();
        assert!(matches!(err, ConfigError::Service { .. }));
    }

    #[test]
    fn rejects_unknown_escalation_channel() {
        let cfg = r#"
[[service]]
id = "a"
probe = { type = "tcp", address = "127.0.0.1:1" }
[service.escalation]
critical = "nowhere"
"#;
        let err = VigilConfig::parse(cfg).unwrap().resolve().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownChannel { channel, .. } if channel == "nowhere"));
    }

    #[test]
    fn rejects_bad_duration() {
        let cfg = r#"
[[service]]
id = "a"
interval = "often"
probe = { type = "tcp", address = "127.0.0.1:1" }
"#;
        let err = VigilConfig::parse(cfg).unwrap().resolve().unwrap_err();
        assert!(matches!(err, ConfigError::Duration { .. }));
    }

    #[test]
    fn unnamed_actions_get_positional_names() {
        let cfg = r#"
[[service]]
id = "a"
probe = { type = "tcp", address = "127.0.0.1:1" }
[[service.recovery.action]]
type = "command"
command = "systemctl"
"#;
        let settings = VigilConfig::parse(cfg).unwrap().resolve().unwrap();
        let recovery = &settings.services[0].recovery;
        assert_eq!(recovery.actions[0].name, "1-systemctl");
        assert_eq!(recovery.max_attempts, 3);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, FULL).unwrap();

        let settings = VigilConfig::load(&path).unwrap();
        assert_eq!(settings.services.len(), 2);

        let missing = VigilConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
