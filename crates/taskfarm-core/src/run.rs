//! The execution attempt of one task.
//!
//! ```text
//! waiting --start--> running --finish--> done --inspect_done--> done
//!    \
//!     cancel--> cancelled
//! ```
//!
//! Every transition validates the current state and returns
//! [`CoreError::InvalidStateTransition`] when called from the wrong one.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::{AgentId, ResourceId, ResultCode, RunId, RunState};

/// Outcome of an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOutcome {
    /// A running run was flagged; the agent is told on its next sync.
    Requested,
    /// A waiting run was cancelled immediately.
    Cancelled,
    /// An abort was already pending.
    AlreadyRequested,
    /// The run has finished.
    NotAbortable,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRun {
    id: RunId,
    state: RunState,
    result: Option<ResultCode>,
    summary: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    agent: Option<AgentId>,
    reserved: BTreeMap<String, ResourceId>,
    abort: Option<String>,
    extraction: Option<RunId>,
    extraction_pending: bool,
}

impl TaskRun {
    /// Create a waiting run.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::generate(),
            state: RunState::Waiting,
            result: None,
            summary: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
            agent: None,
            reserved: BTreeMap::new(),
            abort: None,
            extraction: None,
            extraction_pending: false,
        }
    }

    /// Builder method to set a specific id (useful for testing).
    pub fn with_id(mut self, id: RunId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.state
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

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    /// Agent the run was assigned to.
    pub fn agent(&self) -> Option<&AgentId> {
        self.agent.as_ref()
    }

    /// Resources reserved for this run, by reference.
    pub fn reserved(&self) -> &BTreeMap<String, ResourceId> {
        &self.reserved
    }

    /// Summary stored by a pending abort request.
    pub fn abort_summary(&self) -> Option<&str> {
        self.abort.as_deref()
    }

    /// Shadow run extracting this run's results.
    pub fn extraction(&self) -> Option<&RunId> {
        self.extraction.as_ref()
    }

    /// Returns true while the extraction shadow run has not reported back.
    pub fn extraction_pending(&self) -> bool {
        self.extraction_pending
    }

    /// Returns true if `agent` should currently be executing this run.
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

    /// waiting -> running.
    pub(crate) fn start(
        &mut self,
        agent: AgentId,
        reserved: BTreeMap<String, ResourceId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != RunState::Waiting {
            return Err(self.illegal("start"));
        }
        self.state = RunState::Running;
        self.agent = Some(agent);
        self.reserved = reserved;
        self.started_at = Some(now);
        Ok(())
    }

    /// running -> done.
    ///
    /// A pending abort forces an error result and its summary wins. Returns
    /// the stored result.
    pub(crate) fn finish(
        &mut self,
        result: Option<ResultCode>,
        summary: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ResultCode>> {
        if self.state != RunState::Running {
            return Err(self.illegal("done"));
        }
        self.state = RunState::Done;
        self.stopped_at = Some(now);
        match self.abort.clone() {
            Some(abort_summary) => {
                self.result = Some(ResultCode::Error);
                self.summary = Some(abort_summary);
            }
            None => {
                self.result = result;
                self.summary = summary;
            }
        }
        Ok(self.result)
    }

    /// waiting -> cancelled.
    pub(crate) fn cancel(&mut self, summary: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.state != RunState::Waiting {
            return Err(self.illegal("cancel"));
        }
        self.state = RunState::Cancelled;
        self.result = Some(ResultCode::Cancelled);
        self.summary = Some(summary.into());
        self.stopped_at = Some(now);
        Ok(())
    }

    /// Flag a running run for abortion.
    pub(crate) fn request_abort(&mut self, who: &str) -> AbortOutcome {
        match self.state {
            RunState::Running if self.abort.is_some() => AbortOutcome::AlreadyRequested,
            RunState::Running => {
                self.abort = Some(format!("aborted by {who}"));
                AbortOutcome::Requested
            }
            RunState::Waiting => AbortOutcome::Cancelled,
            RunState::Done | RunState::Cancelled => AbortOutcome::NotAbortable,
        }
    }

    /// Hand the resource bookkeeping back to the job.
    pub(crate) fn take_reserved(&mut self) -> BTreeMap<String, ResourceId> {
        std::mem::take(&mut self.reserved)
    }

    pub(crate) fn set_extraction(&mut self, shadow: RunId) {
        self.extraction = Some(shadow);
        self.extraction_pending = true;
    }

    /// Merge the result of the extraction shadow run.
    pub(crate) fn extraction_done(&mut self, result: ResultCode, summary: Option<String>) -> Result<()> {
        if self.state != RunState::Done {
            return Err(self.illegal("extraction_done"));
        }
        self.extraction_pending = false;
        self.result = Some(match self.result {
            None => result,
            Some(current) => current.combine(result),
        });
        if self.summary.is_none() {
            self.summary = summary;
        }
        Ok(())
    }

    /// done(inspect) -> done(final).
    pub(crate) fn inspect_done(&mut self, result: ResultCode, summary: Option<String>) -> Result<()> {
        if self.state != RunState::Done || self.result != Some(ResultCode::Inspect) {
            return Err(self.illegal("inspect_done"));
        }
        self.result = Some(result);
        if summary.is_some() {
            self.summary = summary;
        }
        Ok(())
    }

    /// Returns true if a running run has exceeded `timeout_minutes`.
    pub fn is_timed_out(&self, timeout_minutes: Option<u32>, now: DateTime<Utc>) -> bool {
        match (self.state, self.started_at, timeout_minutes) {
            (RunState::Running, Some(started), Some(minutes)) => {
                now - started > Duration::minutes(i64::from(minutes))
            }
            _ => false,
        }
    }

    /// Returns true if the agent executing this run should stop: an abort is
    /// pending, the timeout was exceeded, or execution already finished.
    pub fn wants_abort(&self, timeout_minutes: Option<u32>, now: DateTime<Utc>) -> bool {
        match self.state {
            RunState::Running => self.abort.is_some() || self.is_timed_out(timeout_minutes, now),
            RunState::Waiting => false,
            RunState::Done | RunState::Cancelled => true,
        }
    }
}
