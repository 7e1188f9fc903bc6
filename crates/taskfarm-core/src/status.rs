//! Status enums for runs, results and agent connections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one execution attempt of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run created but not yet assigned to an agent.
    #[default]
    Waiting,
    /// Run assigned to an agent and executing.
    Running,
    /// Execution finished (the result may still await inspection).
    Done,
    /// Run was cancelled before it started.
    Cancelled,
}

impl RunState {
    /// Returns true if the run can no longer change state by itself.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Returns true if the run still occupies (or will occupy) an agent.
    pub fn is_active(&self) -> bool {
        !self.is_finished()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of a finished run.
///
/// Variants are ordered by severity so that combining two results can take the
/// maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Execution succeeded.
    Ok,
    /// Execution succeeded with warnings.
    Warning,
    /// Final verdict deferred to an external inspection step.
    Inspect,
    /// Execution failed.
    Error,
    /// Run was cancelled before it started.
    Cancelled,
}

impl ResultCode {
    /// Combine an existing result with a later one, keeping the more severe.
    pub fn combine(self, other: ResultCode) -> ResultCode {
        self.max(other)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Inspect => "inspect",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Connection status of an agent (or of any resource that reports liveness).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Never synced since the control center started.
    #[default]
    Unknown,
    /// Synced within the warning threshold.
    Connected,
    /// Missed syncs for longer than the warning threshold.
    Warning,
    /// Missed syncs for longer than the lost threshold.
    Lost,
}

impl ConnectionStatus {
    /// Returns true if new work may be handed to the resource.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Connected | Self::Warning)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::Warning => "warning",
            Self::Lost => "lost",
        };
        f.write_str(s)
    }
}
