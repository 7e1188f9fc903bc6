//! Shadow runs: follow-up executions that extract the results of a finished
//! task run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use taskfarm_core::error::{CoreError, Result};
use taskfarm_core::{AgentId, JobId, ResultCode, RunId, RunRef, RunState};

#[derive(Debug, Clone, Serialize)]
pub struct ShadowRun {
    id: RunId,
    job_id: JobId,
    task: String,
    /// The execution run whose results this run extracts.
    source: RunId,
    state: RunState,
    agent: Option<AgentId>,
    result: Option<ResultCode>,
    summary: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ShadowRun {
    /// Create a waiting shadow run for the finished execution run `source`.
    pub fn new(source: &RunRef, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::generate(),
            job_id: source.job_id.clone(),
            task: source.task.clone(),
            source: source.run_id.clone(),
            state: RunState::Waiting,
            agent: None,
            result: None,
            summary: None,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn source(&self) -> &RunId {
        &self.source
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn agent(&self) -> Option<&AgentId> {
        self.agent.as_ref()
    }

    pub fn result(&self) -> Option<ResultCode> {
        self.result
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Reference used in the agent's shadow slot.
    pub fn run_ref(&self) -> RunRef {
        RunRef::new(self.job_id.clone(), self.task.as_str(), self.id.clone())
    }

    pub fn is_running_on(&self, agent: &AgentId) -> bool {
        self.state == RunState::Running && self.agent.as_ref() == Some(agent)
    }

    fn illegal(&self, operation: &'static str) -> CoreError {
        CoreError::InvalidStateTransition {
            run: self.id.clone(),
            operation,
            from: self.state,
        }
    }

    pub(crate) fn start(&mut self, agent: AgentId) -> Result<()> {
        if self.state != RunState::Waiting {
            return Err(self.illegal("start"));
        }
        self.state = RunState::Running;
        self.agent = Some(agent);
        Ok(())
    }

    pub(crate) fn finish(
        &mut self,
        result: ResultCode,
        summary: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != RunState::Running {
            return Err(self.illegal("extracted"));
        }
        self.state = RunState::Done;
        self.finished_at = Some(now);
        self.result = Some(result);
        self.summary = summary;
        Ok(())
    }

    /// Drop a shadow run that never started, e.g. because its job was aborted.
    pub(crate) fn cancel(&mut self) -> Result<()> {
        if self.state != RunState::Waiting {
            return Err(self.illegal("cancel"));
        }
        self.state = RunState::Cancelled;
        self.result = Some(ResultCode::Cancelled);
        Ok(())
    }
}
