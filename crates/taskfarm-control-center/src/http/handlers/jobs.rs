//! Job handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::info;

use taskfarm_core::{AbortOutcome, JobDefinition, JobId};

use crate::error::CenterError;
use crate::http::responses::{
    AbortRequest, AbortResponse, InspectRequest, JobCreatedResponse, JobResponse,
    JobSummaryResponse, RerunResponse,
};
use crate::state::AppState;

const ANONYMOUS: &str = "anonymous";

/// Submit a job.
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(def): Json<JobDefinition>,
) -> Result<(StatusCode, Json<JobCreatedResponse>), CenterError> {
    let job_id = state.center.lock().await.submit_job(def, Utc::now())?;
    Ok((StatusCode::CREATED, Json(JobCreatedResponse { job_id })))
}

/// List jobs in submission order.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobSummaryResponse>> {
    let center = state.center.lock().await;
    Json(center.jobs().map(JobSummaryResponse::from).collect())
}

/// Job view with per-task wait reasons.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, CenterError> {
    let center = state.center.lock().await;
    let job = center.job(&JobId::from(id))?;
    let agents = center.agent_infos();
    Ok(Json(JobResponse::new(job, &agents, center.pool())))
}

/// Abort every task of a job.
pub async fn abort_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<AbortRequest>>,
) -> Result<Json<BTreeMap<String, AbortOutcome>>, CenterError> {
    let who = body.and_then(|Json(b)| b.who).unwrap_or_else(|| ANONYMOUS.to_string());
    let outcomes = state
        .center
        .lock()
        .await
        .abort_job(&JobId::from(id), &who, Utc::now())?;
    Ok(Json(outcomes))
}

/// Abort one task.
pub async fn abort_task(
    State(state): State<Arc<AppState>>,
    Path((id, task)): Path<(String, String)>,
    body: Option<Json<AbortRequest>>,
) -> Result<Json<AbortResponse>, CenterError> {
    let who = body.and_then(|Json(b)| b.who).unwrap_or_else(|| ANONYMOUS.to_string());
    let outcome = state
        .center
        .lock()
        .await
        .abort_task(&JobId::from(id), &task, &who, Utc::now())?;
    Ok(Json(AbortResponse { outcome }))
}

/// Start a finished task again.
pub async fn rerun_task(
    State(state): State<Arc<AppState>>,
    Path((id, task)): Path<(String, String)>,
) -> Result<Json<RerunResponse>, CenterError> {
    let run_id = state
        .center
        .lock()
        .await
        .rerun_task(&JobId::from(id), &task, Utc::now())?;
    Ok(Json(RerunResponse { run_id }))
}

/// Record the reviewer's verdict for an `inspect` result.
pub async fn inspect_task(
    State(state): State<Arc<AppState>>,
    Path((id, task)): Path<(String, String)>,
    Json(req): Json<InspectRequest>,
) -> Result<StatusCode, CenterError> {
    state
        .center
        .lock()
        .await
        .inspect_done(&JobId::from(id.as_str()), &task, req.result, req.summary)?;
    info!(job_id = %id, task = %task, result = %req.result, "Inspection recorded");
    Ok(StatusCode::NO_CONTENT)
}
