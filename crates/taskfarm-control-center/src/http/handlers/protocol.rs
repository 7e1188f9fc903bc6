//! Agent protocol handlers: sync and completion reports.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;

use taskfarm_proto::{DoneReport, ExtractedReport, SyncRequest, SyncResponse};

use crate::error::CenterError;
use crate::state::AppState;

/// Agent sync endpoint.
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, CenterError> {
    state.sync(req).await.map(Json)
}

/// Completion report of an execution run.
pub async fn run_done(
    State(state): State<Arc<AppState>>,
    Json(report): Json<DoneReport>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.report_done(report, Utc::now())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Completion report of a shadow run.
pub async fn extracted(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ExtractedReport>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.report_extracted(report, Utc::now())?;
    Ok(StatusCode::NO_CONTENT)
}
