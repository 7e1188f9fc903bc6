//! Liveness and Prometheus endpoints.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde_json::json;
use taskfarm_core::ConnectionStatus;

use crate::state::AppState;

/// Reports the number of known and connected agents alongside the job count.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let center = state.center.lock().await;
    let connected = center
        .registry()
        .iter()
        .filter(|record| record.status == ConnectionStatus::Connected)
        .count();
    Json(json!({
        "status": "ok",
        "agents": center.registry().len(),
        "agents_connected": connected,
        "jobs": center.jobs().count(),
    }))
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&state).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
