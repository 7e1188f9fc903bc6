//! Task definitions and tasks within a job.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceClaim;
use crate::run::TaskRun;
use crate::AgentId;

/// Reserved parameter holding the run timeout in minutes.
pub const TIMEOUT_PARAM: &str = "timeout";

/// Static description of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Task name, unique within a job.
    pub name: String,

    /// Scheduling weight; lower values run first.
    #[serde(default)]
    pub priority: i32,

    /// Resources the task needs.
    #[serde(default)]
    pub claim: ResourceClaim,

    /// Products consumed.
    #[serde(default)]
    pub inputs: BTreeSet<String>,

    /// Products produced.
    #[serde(default)]
    pub outputs: BTreeSet<String>,

    /// Restricts the task to these agents when set.
    #[serde(default)]
    pub agents: Option<BTreeSet<AgentId>>,

    /// Parameters handed to the agent.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Results are extracted by a follow-up shadow run.
    #[serde(default)]
    pub extract: bool,
}

impl TaskDef {
    /// Create a task needing any agent.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            claim: ResourceClaim::default(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            agents: None,
            parameters: BTreeMap::new(),
            extract: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_claim(mut self, claim: ResourceClaim) -> Self {
        self.claim = claim;
        self
    }

    pub fn with_input(mut self, product: impl Into<String>) -> Self {
        self.inputs.insert(product.into());
        self
    }

    pub fn with_output(mut self, product: impl Into<String>) -> Self {
        self.outputs.insert(product.into());
        self
    }

    /// Builder method to restrict the task to a fixed set of agents.
    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_extraction(mut self) -> Self {
        self.extract = true;
        self
    }

    /// Timeout in minutes from the reserved parameter, if set and valid.
    pub fn timeout_minutes(&self) -> Option<u32> {
        self.parameters
            .get(TIMEOUT_PARAM)
            .and_then(|value| value.trim().parse().ok())
            .filter(|&minutes| minutes > 0)
    }

    /// Returns true if `agent` is in the fixed agent subset (or none is set).
    pub fn allows_agent(&self, agent: &AgentId) -> bool {
        self.agents.as_ref().map_or(true, |set| set.contains(agent))
    }
}

/// A task inside a job: its definition and its current run.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    def: TaskDef,
    run: TaskRun,
    binding: Option<AgentId>,
}

impl Task {
    pub(crate) fn new(def: TaskDef, now: DateTime<Utc>) -> Self {
        Self {
            def,
            run: TaskRun::new(now),
            binding: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &TaskDef {
        &self.def
    }

    /// The current (latest) run.
    pub fn run(&self) -> &TaskRun {
        &self.run
    }

    pub(crate) fn run_mut(&mut self) -> &mut TaskRun {
        &mut self.run
    }

    /// Replace a finished run with a fresh waiting one.
    pub(crate) fn replace_run(&mut self, now: DateTime<Utc>) -> &TaskRun {
        self.run = TaskRun::new(now);
        &self.run
    }

    /// Agent the task's local group is bound to.
    pub fn binding(&self) -> Option<&AgentId> {
        self.binding.as_ref()
    }

    pub(crate) fn bind(&mut self, agent: AgentId) {
        self.binding = Some(agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_parameter() {
        assert_eq!(TaskDef::new("t").timeout_minutes(), None);
        assert_eq!(
            TaskDef::new("t").with_parameter(TIMEOUT_PARAM, " 15 ").timeout_minutes(),
            Some(15)
        );
        assert_eq!(
            TaskDef::new("t").with_parameter(TIMEOUT_PARAM, "soon").timeout_minutes(),
            None
        );
        assert_eq!(
            TaskDef::new("t").with_parameter(TIMEOUT_PARAM, "0").timeout_minutes(),
            None
        );
    }

    #[test]
    fn test_agent_subset() {
        let any = TaskDef::new("t");
        assert!(any.allows_agent(&AgentId::new("x")));

        let fixed = TaskDef::new("t").with_agents(["a1", "a2"]);
        assert!(fixed.allows_agent(&AgentId::new("a2")));
        assert!(!fixed.allows_agent(&AgentId::new("x")));
    }

    #[test]
    fn test_deserialize_minimal() {
        let def: TaskDef = serde_json::from_str(r#"{"name": "build"}"#).unwrap();
        assert_eq!(def.name, "build");
        assert!(def.claim.agent_capabilities().is_empty());
    }
}
