//! Agent administration handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;

use taskfarm_core::AgentId;

use crate::error::CenterError;
use crate::http::responses::AgentResponse;
use crate::state::AppState;

/// List agents as JSON.
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentResponse>> {
    let center = state.center.lock().await;
    Json(center.registry().iter().map(AgentResponse::from).collect())
}

/// Stop handing work to an agent.
pub async fn suspend_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.set_suspended(&AgentId::from(id), true)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.set_suspended(&AgentId::from(id), false)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Ask an agent to shut down once idle.
pub async fn request_exit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.request_exit(&AgentId::from(id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Forget an agent; runs still bound to it fail.
pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CenterError> {
    let id = AgentId::from(id);
    state.center.lock().await.delete_agent(&id, Utc::now())?;
    state.forget_agent(&id);
    Ok(StatusCode::NO_CONTENT)
}
