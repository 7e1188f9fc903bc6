//! Resource pool handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use taskfarm_core::{Resource, ResourceId};

use crate::error::CenterError;
use crate::state::AppState;

/// Register a non-agent resource.
pub async fn add_resource(
    State(state): State<Arc<AppState>>,
    Json(resource): Json<Resource>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.add_resource(resource)?;
    Ok(StatusCode::CREATED)
}

/// Remove a non-agent resource.
pub async fn remove_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CenterError> {
    state.center.lock().await.remove_resource(&ResourceId::from(id))?;
    Ok(StatusCode::NO_CONTENT)
}
