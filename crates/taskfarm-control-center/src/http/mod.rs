//! HTTP server for the control center.
//!
//! Provides endpoints for:
//! - The agent protocol (`/v1/sync`, `/v1/runs/done`, `/v1/runs/extracted`)
//! - Jobs (`/v1/jobs`)
//! - Resources (`/v1/resources`)
//! - Agent administration (`/v1/agents`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Agent protocol
        .route("/v1/sync", post(handlers::sync))
        .route("/v1/runs/done", post(handlers::run_done))
        .route("/v1/runs/extracted", post(handlers::extracted))
        // Jobs
        .route("/v1/jobs", get(handlers::list_jobs).post(handlers::submit_job))
        .route("/v1/jobs/:id", get(handlers::get_job))
        .route("/v1/jobs/:id/abort", post(handlers::abort_job))
        .route("/v1/jobs/:id/tasks/:task/abort", post(handlers::abort_task))
        .route("/v1/jobs/:id/tasks/:task/rerun", post(handlers::rerun_task))
        .route("/v1/jobs/:id/tasks/:task/inspect", post(handlers::inspect_task))
        // Resources
        .route("/v1/resources", post(handlers::add_resource))
        .route("/v1/resources/:id", delete(handlers::remove_resource))
        // Agents
        .route("/v1/agents", get(handlers::list_agents))
        .route("/v1/agents/:id", delete(handlers::delete_agent))
        .route("/v1/agents/:id/suspend", post(handlers::suspend_agent))
        .route("/v1/agents/:id/resume", post(handlers::resume_agent))
        .route("/v1/agents/:id/exit", post(handlers::request_exit))
        // Observability
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
