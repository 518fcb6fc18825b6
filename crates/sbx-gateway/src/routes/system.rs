//! Health and metrics endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::json;

use crate::AppState;

/// Liveness: the process is up and serving.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub storage: bool,
    pub isolation: String,
}

/// Readiness: the storage backend answers and an isolation driver is bound.
pub async fn ready(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadyResponse>) {
    let storage_ok = state.store.exists("healthz-probe").await.is_ok();
    let body = ReadyResponse {
        storage: storage_ok,
        isolation: state.manager.driver().kind().to_string(),
    };
    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
