//! Prometheus text exposition format.

use std::fmt::Write as _;

use vigil_state::{ServiceRecord, ServiceState};

use crate::counters::MetricsSnapshot;

const STATES: [ServiceState; 5] = [
    ServiceState::Healthy,
    ServiceState::Degraded,
    ServiceState::Unhealthy,
    ServiceState::Recovering,
    ServiceState::Escalated,
];

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    header(out, name, "counter", help);
    let _ = writeln!(out, "{name} {value}");
}

/// Render engine counters and per-service gauges.
///
/// Per-service series carry a `service` label; `vigil_service_state` is a
/// one-hot gauge over every state.
pub fn render_prometheus(snapshot: &MetricsSnapshot, records: &[ServiceRecord]) -> String {
    let mut out = String::new();

    header(&mut out, "vigil_checks_total", "counter", "Health checks run, by outcome.");
    for (outcome, value) in [
        ("success", snapshot.checks_success),
        ("failure", snapshot.checks_failure),
        ("timeout", snapshot.checks_timeout),
    ] {
        let _ = writeln!(out, "vigil_checks_total{{outcome=\"{outcome}\"}} {value}");
    }

    counter(&mut out, "vigil_transitions_total", "Service state transitions.", snapshot.transitions);

    header(&mut out, "vigil_incidents_total", "counter", "Incident lifecycle events, by kind.");
    for (kind, value) in [
        ("opened", snapshot.incidents_opened),
        ("escalated", snapshot.incidents_escalated),
        ("resolved", snapshot.incidents_resolved),
    ] {
        let _ = writeln!(out, "vigil_incidents_total{{kind=\"{kind}\"}} {value}");
    }

    header(&mut out, "vigil_recovery_sets_total", "counter", "Recovery attempt sets, by result.");
    for (result, value) in [
        ("succeeded", snapshot.recovery_sets_succeeded),
        ("failed", snapshot.recovery_sets_failed),
    ] {
        let _ = writeln!(out, "vigil_recovery_sets_total{{result=\"{result}\"}} {value}");
    }

    header(&mut out, "vigil_notifications_total", "counter", "Notifications, by delivery result.");
    for (result, value) in [
        ("delivered", snapshot.notifications_delivered),
        ("failed", snapshot.notifications_failed),
        ("suppressed", snapshot.notifications_suppressed),
    ] {
        let _ = writeln!(out, "vigil_notifications_total{{result=\"{result}\"}} {value}");
    }

    counter(&mut out, "vigil_store_errors_total", "State store operations that failed.", snapshot.store_errors);

    header(&mut out, "vigil_engine_degraded", "gauge", "1 while the state store is unavailable.");
    let _ = writeln!(out, "vigil_engine_degraded {}", u8::from(snapshot.degraded));

    header(&mut out, "vigil_service_state", "gauge", "Current health state per service (one-hot).");
    for r in records {
        for state in STATES {
            let _ = writeln!(
                out,
                "vigil_service_state{{service=\"{}\",state=\"{}\"}} {}",
                r.service_id,
                state,
                u8::from(r.state == state)
            );
        }
    }

    header(&mut out, "vigil_service_consecutive_failures", "gauge", "Current failure streak per service.");
    for r in records {
        let _ = writeln!(
            out,
            "vigil_service_consecutive_failures{{service=\"{}\"}} {}",
            r.service_id, r.consecutive_failures
        );
    }

    header(&mut out, "vigil_service_open_incident", "gauge", "1 if the service has an open incident.");
    for r in records {
        let _ = writeln!(
            out,
            "vigil_service_open_incident{{service=\"{}\"}} {}",
            r.service_id,
            u8::from(r.open_incident.is_some())
        );
    }

    header(&mut out, "vigil_service_check_latency_ms", "gauge", "Latency of the latest check per service.");
    for r in records {
        if let Some(last) = r.recent_checks.back() {
            let _ = writeln!(
                out,
                "vigil_service_check_latency_ms{{service=\"{}\"}} {}",
                r.service_id, last.latency_ms
            );
        }
    }

    out
}
