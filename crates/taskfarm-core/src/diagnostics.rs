//! Wait diagnostics: why a task cannot be scheduled yet.
//!
//! Every check that can block scheduling appends a [`Reason`] to a
//! caller-supplied `Vec<Reason>`. The reason shown to operators is the maximum
//! of that list, see [`top_reason`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AgentId, ResourceId};

/// Category of a blocking condition. Later variants outrank earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    /// A concrete resource (agents included) is missing, busy or unhealthy.
    Resource,
    /// An input product is not available yet.
    MissingInput,
    /// A plain task does not accept the agent(s) considered.
    PlainTask,
    /// An unbound local group does not accept the agent(s) considered.
    UnboundGroup,
    /// A local group is bound to an agent that cannot be used.
    BoundAgent,
}

/// Scope in which an agent-selection check was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionScope {
    /// Task outside any local group.
    Plain,
    /// Local group not bound to an agent yet.
    UnboundGroup,
    /// Local group already bound to an agent.
    BoundGroup,
}

impl SelectionScope {
    fn category(self) -> ReasonCategory {
        match self {
            Self::Plain => ReasonCategory::PlainTask,
            Self::UnboundGroup => ReasonCategory::UnboundGroup,
            Self::BoundGroup => ReasonCategory::BoundAgent,
        }
    }
}

/// Severity within the resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ResourceLevel {
    /// Matching resources exist but there are too few of them.
    InsufficientCount = 0,
    /// Matching resources are reserved by someone else.
    Reserved = 1,
    /// Matching resources are suspended or have lost their connection.
    Unavailable = 2,
    /// No resource has the required capabilities.
    MissingCapability = 3,
    /// A previously reserved resource no longer exists.
    Deleted = 4,
}

/// A prioritized, human-readable explanation of why a task is waiting.
///
/// Ordering is by category, then level, then description text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reason {
    category: ReasonCategory,
    level: u8,
    description: String,
}

impl Reason {
    fn new(category: ReasonCategory, level: u8, description: String) -> Self {
        Self {
            category,
            level,
            description,
        }
    }

    /// Category of the blocking condition.
    pub fn category(&self) -> ReasonCategory {
        self.category
    }

    /// Priority tuple used for ranking.
    pub fn priority(&self) -> (ReasonCategory, u8) {
        (self.category, self.level)
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Inputs that are not available yet.
    pub fn missing_inputs<'a>(inputs: impl IntoIterator<Item = &'a str>) -> Self {
        let names: Vec<&str> = inputs.into_iter().collect();
        let description = if names.len() == 1 {
            format!("waiting for input '{}'", names[0])
        } else {
            format!("waiting for inputs: {}", names.join(", "))
        };
        Self::new(ReasonCategory::MissingInput, names.len().min(255) as u8, description)
    }

    /// A bound group was offered to a different agent.
    pub fn bound_to_other_agent(bound: &AgentId, offered: &AgentId) -> Self {
        Self::new(
            ReasonCategory::BoundAgent,
            1,
            format!("bound to agent {bound}, not {offered}"),
        )
    }

    /// The agent a group is bound to cannot take work.
    pub fn bound_agent_unavailable(bound: &AgentId, state: &str) -> Self {
        Self::new(
            ReasonCategory::BoundAgent,
            2,
            format!("bound agent {bound} is {state}"),
        )
    }

    /// The agent is not among the agents the task may run on.
    pub fn agent_not_selected(scope: SelectionScope, agent: &AgentId) -> Self {
        Self::new(
            scope.category(),
            1,
            format!("agent {agent} is not selected for this task"),
        )
    }

    /// None of the agents considered are selected for the task.
    pub fn no_selected_agent(scope: SelectionScope) -> Self {
        Self::new(
            scope.category(),
            1,
            "none of the selected agents exist".to_string(),
        )
    }

    /// The agent serves a different target than the job.
    pub fn target_mismatch(scope: SelectionScope, target: &str) -> Self {
        Self::new(
            scope.category(),
            2,
            format!("no agent for target '{target}'"),
        )
    }

    /// The agent(s) lack capabilities the task or group needs.
    pub fn capabilities_missing(scope: SelectionScope, missing: &BTreeSet<String>) -> Self {
        Self::new(
            scope.category(),
            3,
            format!(
                "no agent has the required capabilities: {}",
                join_caps(missing)
            ),
        )
    }

    /// A previously reserved resource was removed from the pool.
    pub fn resource_deleted(id: &ResourceId) -> Self {
        Self::resource(ResourceLevel::Deleted, format!("resource {id} was deleted"))
    }

    /// No resource of the type has the capabilities.
    pub fn no_capable_resource(res_type: &str, caps: &BTreeSet<String>) -> Self {
        Self::resource(
            ResourceLevel::MissingCapability,
            if caps.is_empty() {
                format!("no resource of type '{res_type}' exists")
            } else {
                format!(
                    "no resource of type '{res_type}' has capabilities: {}",
                    join_caps(caps)
                )
            },
        )
    }

    /// Every capable resource is suspended or disconnected.
    pub fn resources_unavailable(res_type: &str, state: &str) -> Self {
        Self::resource(
            ResourceLevel::Unavailable,
            format!("all capable resources of type '{res_type}' are {state}"),
        )
    }

    /// Every capable resource is reserved.
    pub fn resources_reserved(res_type: &str) -> Self {
        Self::resource(
            ResourceLevel::Reserved,
            format!("all capable resources of type '{res_type}' are reserved"),
        )
    }

    /// There are not enough capable, free resources.
    pub fn insufficient_resources(res_type: &str, needed: usize, available: usize) -> Self {
        Self::resource(
            ResourceLevel::InsufficientCount,
            format!(
                "needs {needed} resources of type '{res_type}', only {available} available"
            ),
        )
    }

    fn resource(level: ResourceLevel, description: String) -> Self {
        Self::new(ReasonCategory::Resource, level as u8, description)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

fn join_caps(caps: &BTreeSet<String>) -> String {
    caps.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Returns the highest-priority reason, if any.
pub fn top_reason(reasons: &[Reason]) -> Option<&Reason> {
    reasons.iter().max()
}
