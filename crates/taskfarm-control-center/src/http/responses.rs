//! HTTP request and response types.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};

use taskfarm_core::{
    AbortOutcome, CoreError, Job, JobId, Reason, ResourcePool, ResultCode, RunId, AgentInfo,
};

use crate::error::CenterError;
use crate::registry::AgentRecord;

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl CenterError {
    fn status_code(&self) -> StatusCode {
        match self {
            CenterError::Core(
                CoreError::JobNotFound(_)
                | CoreError::TaskNotFound { .. }
                | CoreError::RunNotFound(_)
                | CoreError::ResourceNotFound(_),
            )
            | CenterError::AgentNotFound(_)
            | CenterError::ShadowNotFound(_) => StatusCode::NOT_FOUND,
            CenterError::Core(
                CoreError::InvalidStateTransition { .. }
                | CoreError::ExtractionPending { .. }
                | CoreError::DuplicateReservation { .. },
            )
            | CenterError::NotBound { .. } => StatusCode::CONFLICT,
            CenterError::Core(CoreError::InvalidClaim(_) | CoreError::InvalidInput(_))
            | CenterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CenterError::Core(CoreError::GroupRebind { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CenterError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Job types
// ============================================================================

/// Response for a submitted job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobCreatedResponse {
    pub job_id: JobId,
}

/// Response for a single task.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub name: String,
    pub run_id: RunId,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Why a waiting task cannot start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<Reason>,
}

/// Response for a job.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub target: String,
    pub owner: String,
    pub created_at: String,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultCode>,
    /// Tasks in execution order.
    pub tasks: Vec<TaskResponse>,
}

impl JobResponse {
    pub fn new(job: &Job, agents: &[&AgentInfo], pool: &ResourcePool) -> Self {
        let tasks = job
            .task_sequence()
            .iter()
            .filter_map(|name| job.task(name).ok())
            .map(|task| {
                let run = task.run();
                TaskResponse {
                    name: task.name().to_string(),
                    run_id: run.id().clone(),
                    state: run.state().to_string(),
                    result: run.result(),
                    summary: run.summary().map(str::to_string),
                    agent: run.agent().map(ToString::to_string),
                    wait_reason: job.wait_reason(task.name(), agents, pool).ok().flatten(),
                }
            })
            .collect();
        Self {
            job_id: job.id().clone(),
            target: job.target().to_string(),
            owner: job.owner().to_string(),
            created_at: job.created_at().to_rfc3339(),
            finished: job.is_finished(),
            result: job.result(),
            tasks,
        }
    }
}

/// Short job entry for the job list.
#[derive(Debug, Serialize)]
pub struct JobSummaryResponse {
    pub job_id: JobId,
    pub target: String,
    pub owner: String,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultCode>,
}

impl From<&Job> for JobSummaryResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id().clone(),
            target: job.target().to_string(),
            owner: job.owner().to_string(),
            finished: job.is_finished(),
            result: job.result(),
        }
    }
}

/// Body of abort requests.
#[derive(Debug, Default, Deserialize)]
pub struct AbortRequest {
    /// Who asked for the abort.
    #[serde(default)]
    pub who: Option<String>,
}

/// Response for a single-task abort.
#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub outcome: AbortOutcome,
}

/// Body of an inspection verdict.
#[derive(Debug, Deserialize)]
pub struct InspectRequest {
    pub result: ResultCode,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Response for a rerun.
#[derive(Debug, Serialize)]
pub struct RerunResponse {
    pub run_id: RunId,
}

// ============================================================================
// Agent types
// ============================================================================

/// Response for a single agent.
#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub agent_id: String,
    pub host: String,
    pub version: String,
    pub target: String,
    pub capabilities: Vec<String>,
    pub status: String,
    pub suspended: bool,
    pub exit_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_run: Option<String>,
}

impl From<&AgentRecord> for AgentResponse {
    fn from(record: &AgentRecord) -> Self {
        Self {
            agent_id: record.id().to_string(),
            host: record.host.clone(),
            version: record.version.clone(),
            target: record.info.target.clone(),
            capabilities: record.info.capabilities.iter().cloned().collect(),
            status: record.status.to_string(),
            suspended: record.suspended,
            exit_requested: record.exit_requested,
            last_sync: record.last_sync.map(|t| t.to_rfc3339()),
            execution_run: record.execution.as_ref().map(ToString::to_string),
            shadow_run: record.shadow.as_ref().map(ToString::to_string),
        }
    }
}
