//! vigil-api — REST API for Vigil.
//!
//! Read-only views over service state and incident history, plus the
//! external event ingestion endpoint.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/services` | Status summary of every service |
//! | GET | `/api/v1/services/{id}` | One service, with open incident and recovery progress |
//! | GET | `/api/v1/services/{id}/checks` | Recent check history |
//! | GET | `/api/v1/incidents` | Incident history (`?open=true`, `?service=id`) |
//! | GET | `/api/v1/incidents/{id}` | One incident with attempts and notifications |
//! | POST | `/api/v1/events` | Ingest an external incident event |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/healthz` | Engine liveness (503 while the store is down) |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use vigil_engine::Engine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the complete API router (REST + metrics + health).
pub fn build_router(engine: Arc<Engine>) -> Router {
    let state = ApiState { engine };

    let api_routes = Router::new()
        .route("/services", get(handlers::list_services))
        .route("/services/{id}", get(handlers::get_service))
        .route("/services/{id}/checks", get(handlers::list_checks))
        .route("/incidents", get(handlers::list_incidents))
        .route("/incidents/{id}", get(handlers::get_incident))
        .route("/events", post(handlers::ingest_event))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
