//! REST API handlers.
//!
//! Reads go straight to the engine's `StateStore`; event ingestion goes
//! through the engine so it lands in the service's pipeline.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vigil_core::{ServiceSpec, Severity};
use vigil_engine::EngineError;
use vigil_health::ExternalEvent;
use vigil_state::{CheckResult, Incident, RecoveryProgress, ServiceRecord, ServiceState};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

// ── Services ───────────────────────────────────────────────────

/// One row of the status summary.
#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub id: String,
    pub probe: &'static str,
    pub interval_ms: u64,
    pub state: ServiceState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub open_incident: Option<String>,
    pub last_check: Option<CheckResult>,
    pub updated_at: u64,
}

impl ServiceSummary {
    fn new(spec: &ServiceSpec, record: ServiceRecord) -> Self {
        Self {
            id: spec.id.clone(),
            probe: spec.probe.kind(),
            interval_ms: spec.interval.as_millis() as u64,
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            consecutive_successes: record.consecutive_successes,
            open_incident: record.open_incident,
            last_check: record.recent_checks.back().cloned(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceDetail {
    #[serde(flatten)]
    pub summary: ServiceSummary,
    pub recovery: Option<RecoveryProgress>,
    pub incident: Option<Incident>,
}

/// Stored record, or the initial one for a service never checked yet.
fn record_or_new(state: &ApiState, id: &str) -> Result<ServiceRecord, vigil_state::StateError> {
    Ok(state
        .engine
        .store()
        .get_service(id)?
        .unwrap_or_else(|| ServiceRecord::new(id, 0)))
}

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    let mut rows = Vec::new();
    for spec in state.engine.services().await {
        match record_or_new(&state, &spec.id) {
            Ok(record) => rows.push(ServiceSummary::new(&spec, record)),
            Err(e) => return internal(e),
        }
    }
    ApiResponse::ok(rows).into_response()
}

/// GET /api/v1/services/{id}
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(spec) = state.engine.service(&id).await else {
        return error_response("service not found", StatusCode::NOT_FOUND).into_response();
    };
    let record = match record_or_new(&state, &id) {
        Ok(record) => record,
        Err(e) => return internal(e),
    };
    let incident = match record.open_incident.as_deref() {
        Some(incident_id) => match state.engine.store().get_incident(incident_id) {
            Ok(incident) => incident,
            Err(e) => return internal(e),
        },
        None => None,
    };
    ApiResponse::ok(ServiceDetail {
        recovery: record.recovery.clone(),
        summary: ServiceSummary::new(&spec, record),
        incident,
    })
    .into_response()
}

/// GET /api/v1/services/{id}/checks
pub async fn list_checks(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.engine.service(&id).await.is_none() {
        return error_response("service not found", StatusCode::NOT_FOUND).into_response();
    }
    match state.engine.store().get_service(&id) {
        Ok(record) => {
            let checks: Vec<CheckResult> = record
                .map(|r| r.recent_checks.into_iter().collect())
                .unwrap_or_default();
            ApiResponse::ok(checks).into_response()
        }
        Err(e) => internal(e),
    }
}

// ── Incidents ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct IncidentQuery {
    #[serde(default)]
    pub open: bool,
    pub service: Option<String>,
}

/// GET /api/v1/incidents
pub async fn list_incidents(
    State(state): State<ApiState>,
    Query(query): Query<IncidentQuery>,
) -> impl IntoResponse {
    let store = state.engine.store();
    let listed = match (&query.service, query.open) {
        (Some(service), _) => store.list_incidents_for_service(service),
        (None, true) => store.open_incidents(),
        (None, false) => store.list_incidents(),
    };
    match listed {
        Ok(incidents) => {
            let incidents: Vec<Incident> = incidents
                .into_iter()
                .filter(|i| !query.open || i.is_open())
                .collect();
            ApiResponse::ok(incidents).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/incidents/{id}
pub async fn get_incident(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.store().get_incident(&id) {
        Ok(Some(incident)) => ApiResponse::ok(incident).into_response(),
        Ok(None) => error_response("incident not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

// ── Ingestion ──────────────────────────────────────────────────

/// External event body. `severity` takes a severity name or a log
/// scanner class (`error`, `warning`, `disk_full`, ...).
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub service_id: String,
    pub severity: String,
    pub cause: String,
}

/// POST /api/v1/events
pub async fn ingest_event(
    State(state): State<ApiState>,
    Json(req): Json<EventRequest>,
) -> impl IntoResponse {
    let Some(severity) = Severity::from_log_class(&req.severity) else {
        return error_response(
            &format!("unknown severity {:?}", req.severity),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    };
    let event = ExternalEvent {
        service_id: req.service_id,
        severity,
        cause: req.cause,
    };
    info!(service = %event.service_id, %severity, "external event received");

    match state.engine.ingest(event.clone()).await {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(event)).into_response(),
        Err(EngineError::UnknownService(id)) => {
            error_response(&format!("unknown service: {id}"), StatusCode::NOT_FOUND)
                .into_response()
        }
        Err(e) => {
            warn!(service = %event.service_id, error = %e, "external event rejected");
            error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.engine.render_metrics(),
    )
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let degraded = state.engine.is_degraded();
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(serde_json::json!({
            "status": if degraded { "degraded" } else { "ok" },
            "services": state.engine.services().await.len(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vigil_core::{ProbeSpec, Settings};
    use vigil_engine::Engine;
    use vigil_state::{IncidentSource, StateStore};

    use super::*;

    fn test_state() -> ApiState {
        let settings = Settings {
            services: vec![ServiceSpec::new(
                "db",
                ProbeSpec::Tcp {
                    address: "127.0.0.1:5432".to_string(),
                },
            )],
            ..Settings::default()
        };
        let engine = Engine::builder(settings)
            .store(StateStore::open_in_memory().unwrap())
            .build()
            .unwrap();
        ApiState {
            engine: Arc::new(engine),
        }
    }

    #[tokio::test]
    async fn list_services_before_any_check() {
        let state = test_state();
        let resp = list_services(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_service() {
        let state = test_state();
        let resp = get_service(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn checks_for_unknown_service() {
        let state = test_state();
        let resp = list_checks(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_stored_incident() {
        let state = test_state();
        let store = state.engine.store();
        let mut record = store.load_or_init_service("db", 0).unwrap();
        let id = record.next_incident_id();
        record.open_incident = Some(id.clone());
        let incident = Incident::open(id.clone(), "db", Severity::Major, "down", IncidentSource::Probe, 5);
        store.commit_transition(&record, Some(&incident)).unwrap();

        let resp = get_incident(State(state.clone()), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_incident(State(state), Path("db-99999".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn event_with_unknown_severity_is_rejected() {
        let state = test_state();
        let req = EventRequest {
            service_id: "db".to_string(),
            severity: "catastrophic-ish".to_string(),
            cause: "?".to_string(),
        };
        let resp = ingest_event(State(state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_before_start_is_unavailable() {
        let state = test_state();
        let req = EventRequest {
            service_id: "db".to_string(),
            severity: "error".to_string(),
            cause: "db_connection".to_string(),
        };
        let resp = ingest_event(State(state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn healthz_ok() {
        let state = test_state();
        let resp = healthz(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
