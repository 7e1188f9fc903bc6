//! The control center: jobs, the resource pool, registered agents and shadow
//! runs, and every operation that mutates them.
//!
//! `ControlCenter` is a plain synchronous object. The server keeps it behind
//! one async mutex so that requests and timers never interleave.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskfarm_core::resource::AGENT_TYPE;
use taskfarm_core::{
    AbortOutcome, AgentId, AgentInfo, ChangeNotifier, ConnectionStatus, CoreError, EventBus, Job,
    JobDefinition, JobId, Reason, Resource, ResourceId, ResourcePool, ResultCode, RunId, RunRef,
    RunState, SyncTimeouts,
};
use taskfarm_proto::convert;
use taskfarm_proto::{Assignment, DoneReport, ExtractedReport};

use crate::config::Config;
use crate::error::{CenterError, Result};
use crate::registry::{AgentRecord, AgentRegistry, RunObserver, Slot};
use crate::shadow::ShadowRun;

/// Capacity of the job-change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

fn shadow_owner(id: &RunId) -> String {
    format!("shadow {id}")
}

/// Central dispatch state.
#[derive(Debug)]
pub struct ControlCenter {
    config: Config,
    timeouts: SyncTimeouts,
    jobs: BTreeMap<JobId, Job>,
    /// Submission order; assignment walks jobs in this order.
    job_order: Vec<JobId>,
    pool: ResourcePool,
    registry: AgentRegistry,
    shadows: BTreeMap<RunId, ShadowRun>,
    pub(crate) observers: EventBus<RunId, RunObserver>,
    notifier: ChangeNotifier,
    changes: broadcast::Sender<Vec<JobId>>,
}

impl ControlCenter {
    pub fn new(config: Config) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let sender = changes.clone();
        let notifier = ChangeNotifier::new(move |jobs| {
            debug!(jobs = jobs.len(), "Jobs changed");
            // Nobody listening is fine.
            let _ = sender.send(jobs.iter().cloned().collect());
        });
        Self {
            timeouts: config.timeouts(),
            config,
            jobs: BTreeMap::new(),
            job_order: Vec::new(),
            pool: ResourcePool::new(),
            registry: AgentRegistry::new(),
            shadows: BTreeMap::new(),
            observers: EventBus::new(),
            notifier,
            changes,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timeouts(&self) -> SyncTimeouts {
        self.timeouts
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut AgentRegistry {
        &mut self.registry
    }

    pub(crate) fn pool_mut(&mut self) -> &mut ResourcePool {
        &mut self.pool
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Receive the ids of changed jobs, one message per notification batch.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<JobId>> {
        self.changes.subscribe()
    }

    /// Jobs in submission order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.job_order.iter().filter_map(|id| self.jobs.get(id))
    }

    pub fn job(&self, id: &JobId) -> Result<&Job> {
        self.jobs
            .get(id)
            .ok_or_else(|| CoreError::JobNotFound(id.clone()).into())
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::JobNotFound(id.clone()).into())
    }

    pub fn shadows(&self) -> impl Iterator<Item = &ShadowRun> {
        self.shadows.values()
    }

    pub fn shadow(&self, id: &RunId) -> Result<&ShadowRun> {
        self.shadows
            .get(id)
            .ok_or_else(|| CenterError::ShadowNotFound(id.clone()))
    }

    pub fn agent(&self, id: &AgentId) -> Result<&AgentRecord> {
        self.registry
            .get(id)
            .ok_or_else(|| CenterError::AgentNotFound(id.clone()))
    }

    fn agent_mut(&mut self, id: &AgentId) -> Result<&mut AgentRecord> {
        self.registry
            .get_mut(id)
            .ok_or_else(|| CenterError::AgentNotFound(id.clone()))
    }

    /// Descriptors of every registered agent.
    pub fn agent_infos(&self) -> Vec<&AgentInfo> {
        self.registry.iter().map(|r| &r.info).collect()
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Create a job from `def`; its tasks start waiting.
    pub fn submit_job(&mut self, def: JobDefinition, now: DateTime<Utc>) -> Result<JobId> {
        let id = JobId::generate();
        let job = Job::new(id.clone(), def, now)?;
        info!(
            job_id = %id,
            target = %job.target(),
            owner = %job.owner(),
            tasks = job.tasks().count(),
            "Job submitted"
        );
        self.jobs.insert(id.clone(), job);
        self.job_order.push(id.clone());
        self.notifier.mark_changed(&id);
        Ok(id)
    }

    /// Why `task` of `job` is still waiting.
    pub fn wait_reason(&self, job: &JobId, task: &str) -> Result<Option<Reason>> {
        let agents = self.agent_infos();
        Ok(self.job(job)?.wait_reason(task, &agents, &self.pool)?)
    }

    /// Abort every task of a job, and drop its shadow runs that did not start.
    pub fn abort_job(
        &mut self,
        id: &JobId,
        who: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, AbortOutcome>> {
        let _batch = self.notifier.batch();
        let job = self.jobs.get_mut(id).ok_or_else(|| CoreError::JobNotFound(id.clone()))?;
        let outcomes = job.abort_all(who, &mut self.pool, now)?;
        let mut cancelled = Vec::new();
        for shadow in self.shadows.values_mut() {
            if shadow.job_id() == id && shadow.state() == RunState::Waiting {
                shadow.cancel()?;
                cancelled.push((shadow.task().to_string(), shadow.source().clone()));
            }
        }
        let summary = format!("extraction aborted by {who}");
        for (task, source) in cancelled {
            self.merge_extraction(id, &task, &source, ResultCode::Cancelled, Some(summary.clone()))?;
        }
        info!(job_id = %id, who, "Job aborted");
        self.notifier.mark_changed(id);
        self.runs_changed(id);
        Ok(outcomes)
    }

    /// Abort one task.
    pub fn abort_task(
        &mut self,
        id: &JobId,
        task: &str,
        who: &str,
        now: DateTime<Utc>,
    ) -> Result<AbortOutcome> {
        let job = self.jobs.get_mut(id).ok_or_else(|| CoreError::JobNotFound(id.clone()))?;
        let outcome = job.abort_task(task, who, &mut self.pool, now)?;
        self.notifier.mark_changed(id);
        self.runs_changed(id);
        Ok(outcome)
    }

    /// Give a finished task a fresh run.
    pub fn rerun_task(&mut self, id: &JobId, task: &str, now: DateTime<Utc>) -> Result<RunId> {
        let job = self.job_mut(id)?;
        let retired = job.task(task)?.run().id().clone();
        let run = job.rerun_task(task, now)?;
        for observer in self.observers.retire(&retired) {
            debug!(agent_id = %observer.agent, run_id = %retired, "Dropping observer of replaced run");
        }
        self.notifier.mark_changed(id);
        Ok(run)
    }

    /// Replace an `inspect` result with the reviewer's verdict.
    pub fn inspect_done(
        &mut self,
        id: &JobId,
        task: &str,
        result: ResultCode,
        summary: Option<String>,
    ) -> Result<()> {
        self.job_mut(id)?.inspect_done(task, result, summary)?;
        self.notifier.mark_changed(id);
        Ok(())
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Add a non-agent resource to the pool.
    pub fn add_resource(&mut self, resource: Resource) -> Result<()> {
        if resource.res_type == AGENT_TYPE {
            return Err(CenterError::InvalidRequest(
                "agents register themselves by syncing".to_string(),
            ));
        }
        info!(resource_id = %resource.id, res_type = %resource.res_type, "Resource added");
        self.pool.add(resource)?;
        Ok(())
    }

    /// Remove a non-agent resource. Jobs holding it report it as deleted.
    pub fn remove_resource(&mut self, id: &ResourceId) -> Result<Resource> {
        let is_agent = self
            .pool
            .get(id)
            .ok_or_else(|| CoreError::ResourceNotFound(id.clone()))?
            .res_type
            == AGENT_TYPE;
        if is_agent {
            return Err(CenterError::InvalidRequest(
                "agents are removed through agent deletion".to_string(),
            ));
        }
        info!(resource_id = %id, "Resource removed");
        self.pool
            .remove(id)
            .ok_or_else(|| CoreError::ResourceNotFound(id.clone()).into())
    }

    // ========================================================================
    // Agent administration
    // ========================================================================

    /// Suspend or resume an agent. A suspended agent gets no new work.
    pub fn set_suspended(&mut self, id: &AgentId, suspended: bool) -> Result<()> {
        self.agent_mut(id)?.suspended = suspended;
        if let Some(resource) = self.pool.get_mut(&ResourceId::from(id)) {
            resource.suspended = suspended;
        }
        info!(agent_id = %id, suspended, "Agent suspension changed");
        Ok(())
    }

    /// Ask an agent to exit once idle.
    pub fn request_exit(&mut self, id: &AgentId) -> Result<()> {
        self.agent_mut(id)?.exit_requested = true;
        info!(agent_id = %id, "Agent exit requested");
        Ok(())
    }

    /// Forget an agent. Runs still bound to it fail.
    pub fn delete_agent(&mut self, id: &AgentId, now: DateTime<Utc>) -> Result<AgentRecord> {
        let _batch = self.notifier.batch();
        self.agent(id)?;
        self.fail_runs_of(id, "agent was deleted", now)?;
        self.observers.unsubscribe_all(&RunObserver {
            agent: id.clone(),
            slot: Slot::Execution,
        });
        self.observers.unsubscribe_all(&RunObserver {
            agent: id.clone(),
            slot: Slot::Shadow,
        });
        self.pool.remove(&ResourceId::from(id));
        let record = self
            .registry
            .remove(id)
            .ok_or_else(|| CenterError::AgentNotFound(id.clone()))?;
        info!(agent_id = %id, "Agent deleted");
        Ok(record)
    }

    // ========================================================================
    // Completion reports
    // ========================================================================

    /// An agent finished an execution run.
    pub fn report_done(&mut self, report: DoneReport, now: DateTime<Utc>) -> Result<()> {
        let agent = AgentId::from(report.agent_id.as_str());
        let run = RunRef::from(report.run);
        let _batch = self.notifier.batch();

        let job = self
            .jobs
            .get_mut(&run.job_id)
            .ok_or_else(|| CoreError::JobNotFound(run.job_id.clone()))?;
        let current = job.task(&run.task)?.run();
        if *current.id() != run.run_id || !current.is_running_on(&agent) {
            warn!(agent_id = %agent, run = %run, "Rejecting done report for run not bound to agent");
            return Err(CenterError::NotBound {
                agent,
                run: run.to_string(),
            });
        }

        let done = job.task_done(
            &run.task,
            report.result.map(Into::into),
            report.summary,
            report.outputs,
            &mut self.pool,
            now,
        )?;
        if done.needs_extraction {
            let shadow = ShadowRun::new(&run, now);
            job.set_extraction(&run.task, shadow.id().clone())?;
            info!(run = %run, shadow_id = %shadow.id(), "Extraction scheduled");
            self.shadows.insert(shadow.id().clone(), shadow);
        }

        self.notifier.mark_changed(&run.job_id);
        self.run_changed(&run.run_id);
        Ok(())
    }

    /// An agent finished a shadow run.
    pub fn report_extracted(&mut self, report: ExtractedReport, now: DateTime<Utc>) -> Result<()> {
        let agent = AgentId::from(report.agent_id.as_str());
        let id = RunId::from(report.shadow_id);
        if !self.shadow(&id)?.is_running_on(&agent) {
            warn!(agent_id = %agent, shadow_id = %id, "Rejecting extraction report for shadow run not bound to agent");
            return Err(CenterError::NotBound {
                agent,
                run: id.to_string(),
            });
        }
        self.finish_shadow(&id, report.result.into(), report.summary, now)
    }

    fn finish_shadow(
        &mut self,
        id: &RunId,
        result: ResultCode,
        summary: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _batch = self.notifier.batch();
        let shadow = self
            .shadows
            .get_mut(id)
            .ok_or_else(|| CenterError::ShadowNotFound(id.clone()))?;
        let agent = shadow.agent().cloned();
        shadow.finish(result, summary.clone(), now)?;
        let (job_id, task, source) = (
            shadow.job_id().clone(),
            shadow.task().to_string(),
            shadow.source().clone(),
        );

        if let Some(agent) = agent {
            self.pool
                .release(&ResourceId::from(&agent), &shadow_owner(id))?;
        }
        info!(shadow_id = %id, job_id = %job_id, task = %task, result = %result, "Extraction done");
        self.notifier.mark_changed(&job_id);
        self.merge_extraction(&job_id, &task, &source, result, summary)?;
        self.run_changed(id);
        Ok(())
    }

    /// Hand an extraction result to the run it was taken from, unless that
    /// run has been replaced in the meantime.
    fn merge_extraction(
        &mut self,
        job_id: &JobId,
        task: &str,
        source: &RunId,
        result: ResultCode,
        summary: Option<String>,
    ) -> Result<()> {
        let job = self.job_mut(job_id)?;
        if job.task(task)?.run().id() != source {
            debug!(job_id = %job_id, task, run_id = %source, "Dropping extraction of replaced run");
            return Ok(());
        }
        job.extraction_done(task, result, summary)?;
        self.notifier.mark_changed(job_id);
        Ok(())
    }

    // ========================================================================
    // Run beliefs
    // ========================================================================

    /// Believe that `agent` works on `run` in `slot`.
    pub(crate) fn watch(&mut self, agent: &AgentId, slot: Slot, run: RunRef) {
        self.observers.subscribe(
            run.run_id.clone(),
            RunObserver {
                agent: agent.clone(),
                slot,
            },
        );
        if let Some(record) = self.registry.get_mut(agent) {
            *record.belief_mut(slot) = Some(run);
        }
    }

    /// Drop the belief about `agent`'s `slot`.
    pub(crate) fn unwatch(&mut self, agent: &AgentId, slot: Slot) -> Option<RunRef> {
        let run = self.registry.get_mut(agent)?.belief_mut(slot).take()?;
        self.observers.unsubscribe(
            &run.run_id,
            &RunObserver {
                agent: agent.clone(),
                slot,
            },
        );
        Some(run)
    }

    /// Returns true if `agent` should currently be executing `run` in `slot`.
    pub(crate) fn is_live(&self, agent: &AgentId, slot: Slot, run: &RunRef) -> bool {
        match slot {
            Slot::Execution => self
                .jobs
                .get(&run.job_id)
                .and_then(|job| job.task(&run.task).ok())
                .is_some_and(|task| *task.run().id() == run.run_id && task.run().is_running_on(agent)),
            Slot::Shadow => self
                .shadows
                .get(&run.run_id)
                .is_some_and(|shadow| shadow.is_running_on(agent)),
        }
    }

    /// Returns true if the agent executing `run` should stop.
    pub(crate) fn wants_abort(&self, agent: &AgentId, slot: Slot, run: &RunRef, now: DateTime<Utc>) -> bool {
        if !self.is_live(agent, slot, run) {
            return true;
        }
        match slot {
            Slot::Execution => self
                .jobs
                .get(&run.job_id)
                .map_or(true, |job| job.wants_abort(&run.task, now).unwrap_or(true)),
            Slot::Shadow => false,
        }
    }

    /// Re-evaluate the agents watching `run` after it changed.
    fn run_changed(&mut self, run: &RunId) {
        for observer in self.observers.subscribers(run).to_vec() {
            let belief = self
                .registry
                .get(&observer.agent)
                .and_then(|r| r.belief(observer.slot).cloned());
            let keep = belief
                .as_ref()
                .is_some_and(|b| b.run_id == *run && self.is_live(&observer.agent, observer.slot, b));
            if keep {
                continue;
            }
            debug!(agent_id = %observer.agent, run_id = %run, "Agent no longer expected to run");
            if belief.is_some_and(|b| b.run_id == *run) {
                self.unwatch(&observer.agent, observer.slot);
            } else {
                self.observers.unsubscribe(run, &observer);
            }
        }
    }

    /// Re-evaluate observers of every current run of a job.
    fn runs_changed(&mut self, job: &JobId) {
        let runs: Vec<RunId> = self
            .jobs
            .get(job)
            .map(|j| j.tasks().map(|t| t.run().id().clone()).collect())
            .unwrap_or_default();
        for run in runs {
            self.run_changed(&run);
        }
    }

    /// Fail `run` if it is still running.
    pub(crate) fn fail_execution(&mut self, run: &RunRef, summary: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(job) = self.jobs.get_mut(&run.job_id) else {
            return Ok(());
        };
        let still_running = job
            .task(&run.task)
            .is_ok_and(|t| *t.run().id() == run.run_id && t.run().state() == RunState::Running);
        if !still_running {
            return Ok(());
        }
        job.fail_run(&run.task, summary, &mut self.pool, now)?;
        self.notifier.mark_changed(&run.job_id);
        self.run_changed(&run.run_id);
        Ok(())
    }

    /// Fail shadow run `id` if it is still running.
    pub(crate) fn fail_shadow(&mut self, id: &RunId, summary: &str, now: DateTime<Utc>) -> Result<()> {
        if !self
            .shadows
            .get(id)
            .is_some_and(|s| s.state() == RunState::Running)
        {
            return Ok(());
        }
        warn!(shadow_id = %id, summary, "Failing shadow run");
        self.finish_shadow(id, ResultCode::Error, Some(summary.to_string()), now)
    }

    /// Fail every run still bound to `agent`.
    fn fail_runs_of(&mut self, agent: &AgentId, summary: &str, now: DateTime<Utc>) -> Result<()> {
        let runs: Vec<RunRef> = self
            .jobs
            .values()
            .flat_map(|job| {
                job.tasks()
                    .filter(|t| t.run().is_running_on(agent))
                    .map(|t| RunRef::new(job.id().clone(), t.name(), t.run().id().clone()))
            })
            .collect();
        for run in &runs {
            self.fail_execution(run, summary, now)?;
        }
        let shadows: Vec<RunId> = self
            .shadows
            .values()
            .filter(|s| s.is_running_on(agent))
            .map(|s| s.id().clone())
            .collect();
        for id in &shadows {
            self.fail_shadow(id, summary, now)?;
        }
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Hand out new work to `agent`: waiting shadow runs first, then jobs in
    /// submission order.
    pub(crate) fn next_assignment(&mut self, agent: &AgentId, now: DateTime<Utc>) -> Result<Option<Assignment>> {
        let record = self.agent(agent)?;
        if !record.accepts_work() {
            return Ok(None);
        }
        let info = record.info.clone();
        let agent_resource = ResourceId::from(agent);
        if !self.pool.get(&agent_resource).is_some_and(Resource::is_free) {
            return Ok(None);
        }

        let shadow = self
            .shadows
            .values()
            .filter(|s| s.state() == RunState::Waiting)
            .filter(|s| self.jobs.get(s.job_id()).is_some_and(|j| j.target() == info.target))
            .min_by_key(|s| s.created_at())
            .map(|s| s.id().clone());
        if let Some(id) = shadow {
            self.pool.reserve(&agent_resource, &shadow_owner(&id))?;
            let shadow = self
                .shadows
                .get_mut(&id)
                .ok_or_else(|| CenterError::ShadowNotFound(id.clone()))?;
            shadow.start(agent.clone())?;
            let run = shadow.run_ref();
            let assignment = convert::extraction_assignment(self.job(&run.job_id)?, &run.task, &id)?;
            info!(agent_id = %agent, shadow_id = %id, run = %run, "Shadow run assigned");
            self.notifier.mark_changed(&run.job_id);
            self.watch(agent, Slot::Shadow, run);
            return Ok(Some(assignment));
        }

        for job_id in self.job_order.clone() {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.is_finished() || job.target() != info.target {
                continue;
            }
            if let Some(run) = job.assign(&info, &mut self.pool, now)? {
                let assignment = convert::execution_assignment(job, &run.task, &self.pool)?;
                self.notifier.mark_changed(&job_id);
                self.watch(agent, Slot::Execution, run);
                return Ok(Some(assignment));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Liveness and timeouts
    // ========================================================================

    fn set_status(&mut self, id: &AgentId, status: ConnectionStatus, now: DateTime<Utc>) -> Result<()> {
        let record = self.agent_mut(id)?;
        if record.status == status {
            return Ok(());
        }
        record.status = status;
        if let Some(resource) = self.pool.get_mut(&ResourceId::from(id)) {
            resource.connection = status;
        }
        match status {
            ConnectionStatus::Warning => warn!(agent_id = %id, "Agent is late to sync"),
            ConnectionStatus::Lost => {
                warn!(agent_id = %id, "Agent lost");
                self.fail_runs_of(id, "agent lost", now)?;
            }
            ConnectionStatus::Connected => info!(agent_id = %id, "Agent connected"),
            ConnectionStatus::Unknown => {}
        }
        Ok(())
    }

    /// Mirror a successful sync on the agent's pool resource.
    pub(crate) fn mark_connected(&mut self, id: &AgentId) {
        if let Some(resource) = self.pool.get_mut(&ResourceId::from(id)) {
            resource.connection = ConnectionStatus::Connected;
        }
    }

    /// The lost timer armed by the sync at `synced_at` fired. Returns false
    /// if the agent synced again since then.
    pub fn mark_agent_lost(
        &mut self,
        id: &AgentId,
        synced_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.agent(id)?.last_sync.is_some_and(|last| last > synced_at) {
            debug!(agent_id = %id, "Stale lost timer ignored");
            return Ok(false);
        }
        let _batch = self.notifier.batch();
        self.set_status(id, ConnectionStatus::Lost, now)?;
        Ok(true)
    }

    /// Recompute every agent's connection status from its last sync. A
    /// failure on one agent is logged and does not stop the others.
    pub fn check_liveness(&mut self, now: DateTime<Utc>) {
        let _batch = self.notifier.batch();
        for id in self.registry.ids() {
            let Some(record) = self.registry.get(&id) else {
                continue;
            };
            let status = self.timeouts.status(record.last_sync, now);
            if status == ConnectionStatus::Unknown {
                continue;
            }
            if let Err(e) = self.set_status(&id, status, now) {
                error!(agent_id = %id, status = %status, "Failed to update agent status: {}", e);
            }
        }
    }

    /// Fail running runs whose timeout expired. Their agents are told to
    /// abort on the next sync.
    pub fn expire_timeouts(&mut self, now: DateTime<Utc>) -> usize {
        let _batch = self.notifier.batch();
        let expired: Vec<RunRef> = self
            .jobs
            .values()
            .flat_map(|job| {
                job.timed_out_tasks(now)
                    .into_iter()
                    .filter_map(|task| job.run_ref(&task).ok())
            })
            .collect();
        for run in &expired {
            warn!(run = %run, "Run timed out");
            if let Err(e) = self.fail_execution(run, "timed out", now) {
                error!(run = %run, "Failed to expire run: {}", e);
            }
        }
        expired.len()
    }

    /// Periodic housekeeping.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let _batch = self.notifier.batch();
        self.check_liveness(now);
        self.expire_timeouts(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;
    use taskfarm_core::{ResourceClaim, TaskDef};
    use taskfarm_proto::pb;
    use taskfarm_proto::{AssignmentKind, SyncAction, SyncRequest};

    fn sync_request(agent: &str, caps: &[&str]) -> SyncRequest {
        SyncRequest {
            agent_id: agent.to_string(),
            host: format!("{agent}.farm"),
            version: "1.0".to_string(),
            target: "linux".to_string(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            execution_run: None,
            shadow_run: None,
        }
    }

    fn claiming(mut request: SyncRequest, assignment: &Assignment) -> SyncRequest {
        let run = pb::RunRef {
            job_id: assignment.job_id.clone(),
            task: assignment.task.clone(),
            run_id: assignment.run_id.clone(),
        };
        match assignment.kind {
            AssignmentKind::Execution => request.execution_run = Some(run),
            AssignmentKind::Extraction => request.shadow_run = Some(run),
        }
        request
    }

    fn done(agent: &str, assignment: &Assignment, outputs: &[(&str, &str)]) -> DoneReport {
        DoneReport {
            agent_id: agent.to_string(),
            run: pb::RunRef {
                job_id: assignment.job_id.clone(),
                task: assignment.task.clone(),
                run_id: assignment.run_id.clone(),
            },
            result: Some(pb::ResultCode::Ok),
            summary: None,
            outputs: outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn job_def(tasks: Vec<TaskDef>) -> JobDefinition {
        JobDefinition {
            target: "linux".to_string(),
            owner: "tester".to_string(),
            tasks,
            products: vec![],
        }
    }

    fn center() -> ControlCenter {
        ControlCenter::new(Config::default())
    }

    #[test]
    fn test_build_then_test_across_two_agents() {
        let mut center = center();
        let t0 = Utc::now();
        center.sync(sync_request("builder", &["gcc"]), t0).unwrap();
        center.sync(sync_request("tester", &["python"]), t0).unwrap();

        let job = center
            .submit_job(
                job_def(vec![
                    TaskDef::new("build")
                        .with_output("bin")
                        .with_claim(ResourceClaim::agent_only(["gcc"])),
                    TaskDef::new("test")
                        .with_input("bin")
                        .with_claim(ResourceClaim::agent_only(["python"])),
                ]),
                t0,
            )
            .unwrap();

        let idle = center.sync(sync_request("tester", &["python"]), t0).unwrap();
        assert!(idle.assignment.is_none());

        let build = center
            .sync(sync_request("builder", &["gcc"]), t0)
            .unwrap()
            .assignment
            .unwrap();
        assert_eq!(build.task, "build");
        center
            .report_done(done("builder", &build, &[("bin", "store://bin")]), t0)
            .unwrap();
        assert!(center.agent(&AgentId::new("builder")).unwrap().execution.is_none());

        let test = center
            .sync(sync_request("tester", &["python"]), t0)
            .unwrap()
            .assignment
            .unwrap();
        assert_eq!(test.task, "test");
        assert_eq!(test.inputs["bin"].locator.as_deref(), Some("store://bin"));

        let running = center
            .sync(claiming(sync_request("tester", &["python"]), &test), t0)
            .unwrap();
        assert_eq!(running.action, SyncAction::Continue);

        center.report_done(done("tester", &test, &[]), t0).unwrap();
        assert!(center.job(&job).unwrap().is_finished());
    }

    #[test]
    fn test_done_report_from_wrong_agent_rejected() {
        let mut center = center();
        let t0 = Utc::now();
        center.sync(sync_request("a", &[]), t0).unwrap();
        center.sync(sync_request("b", &[]), t0).unwrap();
        center
            .submit_job(job_def(vec![TaskDef::new("only")]), t0)
            .unwrap();

        let assignment = center
            .sync(sync_request("a", &[]), t0)
            .unwrap()
            .assignment
            .unwrap();
        assert!(matches!(
            center.report_done(done("b", &assignment, &[]), t0),
            Err(CenterError::NotBound { .. })
        ));
    }

    #[test]
    fn test_liveness_thresholds_fail_bound_run() {
        let mut center = center();
        let t0 = Utc::now();
        center.sync(sync_request("a", &[]), t0).unwrap();
        let job = center
            .submit_job(job_def(vec![TaskDef::new("long")]), t0)
            .unwrap();
        center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();

        center.check_liveness(t0 + Duration::seconds(31));
        assert_eq!(center.agent(&AgentId::new("a")).unwrap().status, ConnectionStatus::Connected);

        center.check_liveness(t0 + Duration::seconds(32));
        assert_eq!(center.agent(&AgentId::new("a")).unwrap().status, ConnectionStatus::Warning);
        let run = center.job(&job).unwrap().task("long").unwrap().run().clone();
        assert_eq!(run.state(), RunState::Running);

        center.check_liveness(t0 + Duration::seconds(302));
        let record = center.agent(&AgentId::new("a")).unwrap();
        assert_eq!(record.status, ConnectionStatus::Lost);
        assert!(record.execution.is_none());
        let run = center.job(&job).unwrap().task("long").unwrap().run().clone();
        assert_eq!(run.state(), RunState::Done);
        assert_eq!(run.result(), Some(ResultCode::Error));
        assert_eq!(run.summary(), Some("agent lost"));
    }

    #[test]
    fn test_stale_lost_timer_ignored_after_fresh_sync() {
        let mut center = center();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(100);
        center.sync(sync_request("a", &[]), t0).unwrap();
        center.sync(sync_request("a", &[]), t1).unwrap();

        let agent = AgentId::new("a");
        assert!(!center.mark_agent_lost(&agent, t0, t0 + Duration::seconds(302)).unwrap());
        assert_eq!(center.agent(&agent).unwrap().status, ConnectionStatus::Connected);

        assert!(center.mark_agent_lost(&agent, t1, t1 + Duration::seconds(302)).unwrap());
        assert_eq!(center.agent(&agent).unwrap().status, ConnectionStatus::Lost);
    }

    #[test]
    fn test_timed_out_run_fails_and_agent_is_told_to_abort() {
        let mut center = center();
        let t0 = Utc::now();
        center.sync(sync_request("a", &[]), t0).unwrap();
        let job = center
            .submit_job(
                job_def(vec![TaskDef::new("slow").with_parameter("timeout", "1")]),
                t0,
            )
            .unwrap();
        let assignment = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();

        let later = t0 + Duration::seconds(61);
        assert_eq!(center.expire_timeouts(later), 1);
        let run = center.job(&job).unwrap().task("slow").unwrap().run().clone();
        assert_eq!(run.result(), Some(ResultCode::Error));

        let response = center
            .sync(claiming(sync_request("a", &[]), &assignment), later)
            .unwrap();
        assert_eq!(response.action, SyncAction::Abort);
    }

    #[test]
    fn test_extraction_runs_as_shadow_first() {
        let mut center = center();
        let t0 = Utc::now();
        center.sync(sync_request("a", &[]), t0).unwrap();
        let job = center
            .submit_job(
                job_def(vec![
                    TaskDef::new("test").with_extraction(),
                    TaskDef::new("later").with_priority(5),
                ]),
                t0,
            )
            .unwrap();

        let test = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();
        let mut report = done("a", &test, &[]);
        report.result = None;
        center.report_done(report, t0).unwrap();

        let extraction = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();
        assert_eq!(extraction.kind, AssignmentKind::Extraction);
        assert_eq!(extraction.task, "test");

        center
            .report_extracted(
                ExtractedReport {
                    agent_id: "a".to_string(),
                    shadow_id: extraction.run_id.clone(),
                    result: pb::ResultCode::Warning,
                    summary: Some("1 flaky".to_string()),
                },
                t0,
            )
            .unwrap();
        let run = center.job(&job).unwrap().task("test").unwrap().run().clone();
        assert_eq!(run.result(), Some(ResultCode::Warning));

        let later = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();
        assert_eq!(later.task, "later");
    }

    /// Agent `a` finishes an extracting task without a result; returns the
    /// job and the finished run.
    fn finished_awaiting_extraction(center: &mut ControlCenter, t0: DateTime<Utc>) -> (JobId, RunId) {
        center.sync(sync_request("a", &[]), t0).unwrap();
        let job = center
            .submit_job(job_def(vec![TaskDef::new("test").with_extraction()]), t0)
            .unwrap();
        let test = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();
        let mut report = done("a", &test, &[]);
        report.result = None;
        center.report_done(report, t0).unwrap();
        (job, RunId::from(test.run_id))
    }

    fn extracted(agent: &str, shadow: &Assignment, result: pb::ResultCode) -> ExtractedReport {
        ExtractedReport {
            agent_id: agent.to_string(),
            shadow_id: shadow.run_id.clone(),
            result,
            summary: None,
        }
    }

    #[test]
    fn test_rerun_rejected_while_extraction_pending() {
        let mut center = center();
        let t0 = Utc::now();
        let (job, first) = finished_awaiting_extraction(&mut center, t0);
        let shadow = center.sync(sync_request("b", &[]), t0).unwrap().assignment.unwrap();
        assert_eq!(shadow.kind, AssignmentKind::Extraction);

        assert!(matches!(
            center.rerun_task(&job, "test", t0),
            Err(CenterError::Core(CoreError::ExtractionPending { .. }))
        ));

        center
            .report_extracted(extracted("b", &shadow, pb::ResultCode::Warning), t0)
            .unwrap();
        let run = center.job(&job).unwrap().task("test").unwrap().run().clone();
        assert_eq!(*run.id(), first);
        assert_eq!(run.result(), Some(ResultCode::Warning));
        assert!(center.pool().get(&ResourceId::new("b")).unwrap().is_free());

        let second = center.rerun_task(&job, "test", t0).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn test_extraction_of_replaced_run_is_dropped() {
        let mut center = center();
        let t0 = Utc::now();
        let (job, first) = finished_awaiting_extraction(&mut center, t0);
        let shadow = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();
        center
            .report_extracted(extracted("a", &shadow, pb::ResultCode::Ok), t0)
            .unwrap();
        let second = center.rerun_task(&job, "test", t0).unwrap();

        center
            .merge_extraction(&job, "test", &first, ResultCode::Error, None)
            .unwrap();
        let run = center.job(&job).unwrap().task("test").unwrap().run().clone();
        assert_eq!(*run.id(), second);
        assert_eq!(run.state(), RunState::Waiting);
        assert_eq!(run.result(), None);
    }

    #[test]
    fn test_liveness_check_continues_past_failing_agent() {
        let mut center = center();
        let t0 = Utc::now();
        let (job, _) = finished_awaiting_extraction(&mut center, t0);
        let shadow = center.sync(sync_request("b", &[]), t0).unwrap().assignment.unwrap();
        assert_eq!(shadow.kind, AssignmentKind::Extraction);
        center.sync(sync_request("c", &[]), t0).unwrap();
        // Failing b's shadow run can no longer reach its job.
        center.jobs.remove(&job);

        center.check_liveness(t0 + Duration::seconds(400));
        for id in ["a", "b", "c"] {
            assert_eq!(
                center.agent(&AgentId::new(id)).unwrap().status,
                ConnectionStatus::Lost,
                "agent {id}"
            );
        }
    }

    #[test]
    fn test_abort_job_settles_pending_extraction() {
        let mut center = center();
        let t0 = Utc::now();
        let (job, _) = finished_awaiting_extraction(&mut center, t0);

        center.abort_job(&job, "alice", t0).unwrap();
        let run = center.job(&job).unwrap().task("test").unwrap().run().clone();
        assert_eq!(run.result(), Some(ResultCode::Cancelled));
        assert_eq!(run.summary(), Some("extraction aborted by alice"));
        assert!(!run.extraction_pending());
        assert!(center
            .shadows()
            .all(|shadow| shadow.state() == RunState::Cancelled));
    }

    #[test]
    fn test_abort_job_and_delete_agent() {
        let mut center = center();
        let t0 = Utc::now();
        center.sync(sync_request("a", &[]), t0).unwrap();
        let job = center
            .submit_job(
                job_def(vec![
                    TaskDef::new("build").with_output("bin"),
                    TaskDef::new("test").with_input("bin"),
                ]),
                t0,
            )
            .unwrap();
        let build = center.sync(sync_request("a", &[]), t0).unwrap().assignment.unwrap();

        let outcomes = center.abort_job(&job, "alice", t0).unwrap();
        assert_eq!(outcomes["build"], AbortOutcome::Requested);
        assert_eq!(outcomes["test"], AbortOutcome::Cancelled);

        let response = center
            .sync(claiming(sync_request("a", &[]), &build), t0)
            .unwrap();
        assert_eq!(response.action, SyncAction::Abort);

        center.delete_agent(&AgentId::new("a"), t0).unwrap();
        let run = center.job(&job).unwrap().task("build").unwrap().run().clone();
        assert_eq!(run.summary(), Some("aborted by alice"));
        assert!(center.pool().is_empty());
        assert!(center.observers.is_empty());
    }

    #[test]
    fn test_changes_are_broadcast_once_per_batch() {
        let mut center = center();
        let mut changes = center.subscribe_changes();
        let t0 = Utc::now();
        center.sync(sync_request("a", &[]), t0).unwrap();
        let job = center
            .submit_job(job_def(vec![TaskDef::new("one"), TaskDef::new("two")]), t0)
            .unwrap();
        assert_eq!(changes.try_recv().unwrap(), vec![job.clone()]);

        let fired = center.notifier().fired();
        center.abort_job(&job, "bob", t0).unwrap();
        assert_eq!(center.notifier().fired(), fired + 1);
        assert_eq!(changes.try_recv().unwrap(), vec![job]);
        assert!(changes.try_recv().is_err());
    }
}
