//! Core domain errors.
//!
//! Everything in here signals an internal inconsistency. Conditions caused by
//! the environment (agents going silent, resources being busy) are reported
//! through [`crate::diagnostics::Reason`] values instead.

use thiserror::Error;

use crate::{AgentId, JobId, ResourceId, RunId, RunState};

/// Core domain errors for Task Farm.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Task not found in a job.
    #[error("Task '{task}' not found in job {job}")]
    TaskNotFound { job: JobId, task: String },

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Resource not found in the pool.
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// Operation called from a run state that does not permit it.
    #[error("Invalid state transition for run {run}: {operation} in state {from}")]
    InvalidStateTransition {
        run: RunId,
        operation: &'static str,
        from: RunState,
    },

    /// A run cannot be replaced while its extraction is still outstanding.
    #[error("Extraction {shadow} of task '{task}' has not finished")]
    ExtractionPending { task: String, shadow: RunId },

    /// A bound local group was asked to move to another agent.
    #[error("Local group of task '{task}' is bound to {bound}, refusing to bind to {requested}")]
    GroupRebind {
        task: String,
        bound: AgentId,
        requested: AgentId,
    },

    /// A resource was reserved twice by different owners.
    #[error("Resource {resource} already reserved by {owner}")]
    DuplicateReservation { resource: ResourceId, owner: String },

    /// Resource claim violates its structural rules.
    #[error("Invalid resource claim: {0}")]
    InvalidClaim(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
