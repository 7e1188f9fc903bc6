//! Messages of the agent sync protocol (JSON over HTTP).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reference to one run: job, task and run id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRef {
    pub job_id: String,
    pub task: String,
    pub run_id: String,
}

/// Result codes reported by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    Warning,
    Inspect,
    Error,
    Cancelled,
}

/// Periodic message from an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub agent_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub version: String,
    /// Target the agent serves; only used at registration.
    pub target: String,
    /// Capabilities; only used at registration.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Execution run the agent is currently working on.
    #[serde(default)]
    pub execution_run: Option<RunRef>,
    /// Shadow run the agent is currently working on.
    #[serde(default)]
    pub shadow_run: Option<RunRef>,
}

/// What the agent must do with the run(s) it reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    #[default]
    Continue,
    Abort,
}

/// Answer to a [`SyncRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub action: SyncAction,
    /// New work, only handed to idle agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
    /// The agent should shut down once idle.
    #[serde(default)]
    pub exit: bool,
    /// Seconds until the next expected sync.
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    /// Execute a task.
    Execution,
    /// Extract the results of a finished execution.
    Extraction,
}

/// A resource handed to the agent for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLocator {
    pub id: String,
    #[serde(rename = "type")]
    pub res_type: String,
    pub locator: String,
}

/// Where an input product can be fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLocator {
    /// Locator of a plain product.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    /// Locators of a combined product, by producing task.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locators: BTreeMap<String, String>,
}

/// Work package for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub kind: AssignmentKind,
    pub job_id: String,
    pub task: String,
    pub run_id: String,
    /// Resources by claim reference.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceLocator>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputLocator>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Completion report of an execution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneReport {
    pub agent_id: String,
    pub run: RunRef,
    /// Absent when the result is left to extraction.
    #[serde(default)]
    pub result: Option<ResultCode>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Locators of produced outputs, by product name.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Completion report of a shadow (extraction) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedReport {
    pub agent_id: String,
    pub shadow_id: String,
    pub result: ResultCode,
    #[serde(default)]
    pub summary: Option<String>,
}
