//! Control center errors.

use thiserror::Error;

use taskfarm_core::{AgentId, CoreError, RunId};

/// Control center errors.
#[derive(Debug, Error)]
pub enum CenterError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Shadow run not found: {0}")]
    ShadowNotFound(RunId),

    /// A completion report came from an agent the run is not bound to.
    #[error("Agent {agent} is not running {run}")]
    NotBound { agent: AgentId, run: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, CenterError>;
