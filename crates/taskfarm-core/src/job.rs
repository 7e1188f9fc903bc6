//! Jobs: a set of tasks linked through products, plus the resources the job
//! holds on behalf of its tasks.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{missing_capabilities, AgentInfo};
use crate::diagnostics::{top_reason, Reason, SelectionScope};
use crate::error::{CoreError, Result};
use crate::graph::MainGroup;
use crate::matcher::{self, unavailable_reason};
use crate::product::{Product, ProductDef};
use crate::resource::{ResourcePool, ResourceSpec, AGENT_REF, AGENT_TYPE};
use crate::run::{AbortOutcome, TaskRun};
use crate::task::{Task, TaskDef};
use crate::{JobId, ResourceId, ResultCode, RunId, RunRef, RunState};

/// Job definition as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Target (platform) every task runs on.
    pub target: String,

    /// Who submitted the job.
    #[serde(default)]
    pub owner: String,

    pub tasks: Vec<TaskDef>,

    /// Product declarations. Products used by tasks but not declared here
    /// are plain products.
    #[serde(default)]
    pub products: Vec<ProductDef>,
}

/// What a finished run asks of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDone {
    /// Stored result of the run.
    pub result: Option<ResultCode>,
    /// A shadow run must extract the results.
    pub needs_extraction: bool,
}

/// A submitted job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    id: JobId,
    target: String,
    owner: String,
    created_at: DateTime<Utc>,
    tasks: BTreeMap<String, Task>,
    products: BTreeMap<String, Product>,
    /// Resources held by the job, by claim reference.
    reservations: BTreeMap<String, ResourceId>,
    #[serde(skip)]
    groups: OnceCell<MainGroup>,
}

fn agent_owner(run: &RunId) -> String {
    format!("run {run}")
}

impl Job {
    /// Create a job from its definition; every task gets a waiting run.
    pub fn new(id: JobId, def: JobDefinition, now: DateTime<Utc>) -> Result<Self> {
        let mut job = Self {
            id,
            target: def.target,
            owner: def.owner,
            created_at: now,
            tasks: BTreeMap::new(),
            products: BTreeMap::new(),
            reservations: BTreeMap::new(),
            groups: OnceCell::new(),
        };

        for product in def.products {
            if job.products.contains_key(&product.name) {
                return Err(CoreError::InvalidInput(format!(
                    "product '{}' declared twice",
                    product.name
                )));
            }
            job.products
                .insert(product.name.clone(), Product::new(product, BTreeSet::new()));
        }
        for task in def.tasks {
            job.add_task(task, now)?;
        }
        Ok(job)
    }

    /// Add a task to the job. Cached groups are rebuilt on next use.
    pub fn add_task(&mut self, def: TaskDef, now: DateTime<Utc>) -> Result<()> {
        if def.name.is_empty() {
            return Err(CoreError::InvalidInput("task without a name".to_string()));
        }
        if self.tasks.contains_key(&def.name) {
            return Err(CoreError::InvalidInput(format!(
                "task '{}' defined twice in job {}",
                def.name, self.id
            )));
        }
        for product in def.inputs.iter().chain(&def.outputs) {
            self.products
                .entry(product.clone())
                .or_insert_with(|| Product::new(ProductDef::new(product.as_str()), BTreeSet::new()));
        }
        for output in &def.outputs {
            if let Some(product) = self.products.get_mut(output) {
                product.add_producer(&def.name);
            }
        }
        self.tasks.insert(def.name.clone(), Task::new(def, now));
        self.groups = OnceCell::new();
        Ok(())
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task(&self, name: &str) -> Result<&Task> {
        self.tasks.get(name).ok_or_else(|| CoreError::TaskNotFound {
            job: self.id.clone(),
            task: name.to_string(),
        })
    }

    fn task_mut(&mut self, name: &str) -> Result<&mut Task> {
        let id = &self.id;
        self.tasks.get_mut(name).ok_or_else(|| CoreError::TaskNotFound {
            job: id.clone(),
            task: name.to_string(),
        })
    }

    pub fn product(&self, name: &str) -> Option<&Product> {
        self.products.get(name)
    }

    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.products.values()
    }

    /// Resource held by the job for claim reference `reference`.
    pub fn reservation(&self, reference: &str) -> Option<&ResourceId> {
        self.reservations.get(reference)
    }

    /// Reference to the current run of `task`.
    pub fn run_ref(&self, task: &str) -> Result<RunRef> {
        let task = self.task(task)?;
        Ok(RunRef::new(
            self.id.clone(),
            task.name(),
            task.run().id().clone(),
        ))
    }

    /// The task whose current run is `run`.
    pub fn find_run(&self, run: &RunId) -> Option<&Task> {
        self.tasks.values().find(|t| t.run().id() == run)
    }

    /// Groups and sequence, computed on first use.
    pub fn main_group(&self) -> &MainGroup {
        self.groups
            .get_or_init(|| MainGroup::build(&self.tasks, &self.products))
    }

    /// Task names in execution order.
    pub fn task_sequence(&self) -> Vec<String> {
        self.main_group().task_sequence()
    }

    /// Inputs of `task` that are not available yet.
    pub fn missing_inputs(&self, task: &str) -> Result<Vec<&str>> {
        let task = self.task(task)?;
        Ok(task
            .def()
            .inputs
            .iter()
            .filter(|name| !self.products.get(*name).is_some_and(Product::is_available))
            .map(String::as_str)
            .collect())
    }

    /// Returns true if no run of this job is waiting or running.
    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(|t| t.run().state().is_finished())
    }

    /// Combined result of all finished runs.
    pub fn result(&self) -> Option<ResultCode> {
        self.tasks
            .values()
            .filter_map(|t| t.run().result())
            .reduce(ResultCode::combine)
    }

    fn reservation_owner(&self, reference: &str) -> String {
        format!("job {}:{reference}", self.id)
    }

    /// Agent-selection checks for `def`; returns the agents that pass them.
    fn selectable_agents<'a>(
        &self,
        def: &TaskDef,
        agents: &[&'a AgentInfo],
        scope: SelectionScope,
        reasons: &mut Vec<Reason>,
    ) -> Vec<&'a AgentInfo> {
        let needed = def.claim.agent_capabilities();
        if agents.is_empty() {
            reasons.push(Reason::no_capable_resource(AGENT_TYPE, needed));
            return Vec::new();
        }

        let on_target: Vec<&AgentInfo> = agents
            .iter()
            .copied()
            .filter(|a| a.target == self.target)
            .collect();
        if on_target.is_empty() {
            reasons.push(Reason::target_mismatch(scope, &self.target));
            return Vec::new();
        }

        let selected: Vec<&AgentInfo> = on_target
            .iter()
            .copied()
            .filter(|a| def.allows_agent(&a.id))
            .collect();
        if selected.is_empty() {
            match on_target.as_slice() {
                [only] => reasons.push(Reason::agent_not_selected(scope, &only.id)),
                _ => reasons.push(Reason::no_selected_agent(scope)),
            }
            return Vec::new();
        }

        let capable: Vec<&AgentInfo> = selected
            .iter()
            .copied()
            .filter(|a| a.has_capabilities(needed))
            .collect();
        if capable.is_empty() {
            // For a plain task the agent is just another resource.
            let missing = missing_capabilities(needed, &selected);
            reasons.push(match scope {
                SelectionScope::Plain => Reason::no_capable_resource(AGENT_TYPE, &missing),
                _ => Reason::capabilities_missing(scope, &missing),
            });
        }
        capable
    }

    /// Check the non-agent resources of `def` without reserving anything.
    fn check_resources(&self, def: &TaskDef, pool: &ResourcePool, reasons: &mut Vec<Reason>) -> bool {
        let mut ok = true;
        let mut fresh: Vec<&ResourceSpec> = Vec::new();
        for spec in def.claim.non_agent_specs() {
            match self.reservations.get(&spec.reference) {
                Some(held) => match pool.get(held) {
                    None => {
                        reasons.push(Reason::resource_deleted(held));
                        ok = false;
                    }
                    Some(resource) if !resource.satisfies(spec) => {
                        reasons.push(Reason::no_capable_resource(&spec.res_type, &spec.capabilities));
                        ok = false;
                    }
                    Some(_) => {}
                },
                None => fresh.push(spec),
            }
        }
        if !fresh.is_empty() && matcher::match_claim(&fresh, pool, reasons).is_none() {
            ok = false;
        }
        ok
    }

    /// Returns true if `task` could start on one of `agents` right now;
    /// otherwise `reasons` explains why not.
    pub(crate) fn check_task(
        &self,
        name: &str,
        agents: &[&AgentInfo],
        pool: &ResourcePool,
        scope: SelectionScope,
        reasons: &mut Vec<Reason>,
    ) -> bool {
        let Some(task) = self.tasks.get(name) else {
            return false;
        };
        if task.run().state() != RunState::Waiting {
            return false;
        }

        let mut ok = true;
        let missing = self.missing_inputs(name).unwrap_or_default();
        if !missing.is_empty() {
            reasons.push(Reason::missing_inputs(missing));
            ok = false;
        }

        let capable = self.selectable_agents(task.def(), agents, scope, reasons);
        if capable.is_empty() {
            ok = false;
        } else {
            let resources: Vec<_> = capable
                .iter()
                .filter_map(|a| pool.get(&ResourceId::from(&a.id)))
                .collect();
            if !resources.iter().any(|r| r.is_free()) {
                reasons.push(if resources.is_empty() {
                    Reason::no_capable_resource(AGENT_TYPE, task.def().claim.agent_capabilities())
                } else {
                    unavailable_reason(AGENT_TYPE, resources.iter().copied())
                });
                ok = false;
            }
        }

        if !self.check_resources(task.def(), pool, reasons) {
            ok = false;
        }
        ok
    }

    /// Why `task` is still waiting, considering `agents`.
    pub fn wait_reason(
        &self,
        task: &str,
        agents: &[&AgentInfo],
        pool: &ResourcePool,
    ) -> Result<Option<Reason>> {
        if self.task(task)?.run().state() != RunState::Waiting {
            return Ok(None);
        }
        let mut reasons = Vec::new();
        let runnable = match self.main_group().local_group_of(task) {
            Some(group) => match group.candidates(self, agents, pool, &mut reasons) {
                Some((candidates, scope)) => {
                    self.check_task(task, &candidates, pool, scope, &mut reasons)
                }
                None => false,
            },
            None => self.check_task(task, agents, pool, SelectionScope::Plain, &mut reasons),
        };
        if runnable {
            return Ok(None);
        }
        Ok(top_reason(&reasons).cloned())
    }

    /// Why nothing in this job can start on `agents`, if that is the case.
    pub fn blocking_reason(&self, agents: &[&AgentInfo], pool: &ResourcePool) -> Option<Reason> {
        let mut reasons = Vec::new();
        if self.main_group().check_runners(self, agents, pool, &mut reasons) {
            return None;
        }
        top_reason(&reasons).cloned()
    }

    /// Hand the first acceptable waiting task to `agent`.
    pub fn assign(
        &mut self,
        agent: &AgentInfo,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRef>> {
        let candidates = self.main_group().assign_candidates(self, agent);
        for name in candidates {
            if let Some(run) = self.try_assign(&name, agent, pool, now)? {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    /// Start `name` on `agent` if all its conditions hold.
    ///
    /// Returns `Ok(None)` when the task cannot start yet; errors signal an
    /// illegal transition or a group rebind.
    pub fn try_assign(
        &mut self,
        name: &str,
        agent: &AgentInfo,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRef>> {
        let task = self.task(name)?;
        let run = task.run();
        if run.state() != RunState::Waiting {
            return Err(CoreError::InvalidStateTransition {
                run: run.id().clone(),
                operation: "assign",
                from: run.state(),
            });
        }
        let run_id = run.id().clone();
        let def = task.def().clone();

        let group_members = match self.main_group().local_group_of(name) {
            Some(group) => {
                if let Some(bound) = group.bound_agent(self) {
                    if *bound != agent.id {
                        return Err(CoreError::GroupRebind {
                            task: name.to_string(),
                            bound: bound.clone(),
                            requested: agent.id.clone(),
                        });
                    }
                }
                group.members().to_vec()
            }
            None => Vec::new(),
        };

        let mut scratch = Vec::new();
        if !self.missing_inputs(name)?.is_empty() {
            return Ok(None);
        }
        if self
            .selectable_agents(&def, &[agent], SelectionScope::Plain, &mut scratch)
            .is_empty()
        {
            return Ok(None);
        }
        let agent_resource = ResourceId::from(&agent.id);
        if !pool.get(&agent_resource).is_some_and(|r| r.is_free()) {
            return Ok(None);
        }

        let mut reserved = BTreeMap::new();
        let mut fresh = Vec::new();
        for spec in def.claim.non_agent_specs() {
            match self.reservations.get(&spec.reference) {
                Some(held) => {
                    if !pool.get(held).is_some_and(|r| r.satisfies(spec)) {
                        return Ok(None);
                    }
                    reserved.insert(spec.reference.clone(), held.clone());
                }
                None => fresh.push(spec),
            }
        }
        let Some(found) = matcher::match_claim(&fresh, pool, &mut scratch) else {
            return Ok(None);
        };

        for (reference, resource) in found {
            pool.reserve(&resource, &self.reservation_owner(&reference))?;
            self.reservations.insert(reference.clone(), resource.clone());
            reserved.insert(reference, resource);
        }
        pool.reserve(&agent_resource, &agent_owner(&run_id))?;
        reserved.insert(AGENT_REF.to_string(), agent_resource);

        self.task_mut(name)?
            .run_mut()
            .start(agent.id.clone(), reserved, now)?;
        for member in &group_members {
            if let Some(task) = self.tasks.get_mut(member) {
                task.bind(agent.id.clone());
            }
        }

        info!(
            job_id = %self.id,
            task = name,
            run_id = %run_id,
            agent_id = %agent.id,
            "Task assigned"
        );
        Ok(Some(RunRef::new(self.id.clone(), name, run_id)))
    }

    /// Release job reservations no waiting or running task refers to.
    fn release_unneeded(&mut self, pool: &mut ResourcePool) -> Result<()> {
        let unneeded: Vec<String> = self
            .reservations
            .keys()
            .filter(|reference| {
                !self.tasks.values().any(|t| {
                    !t.run().state().is_finished() && t.def().claim.get(reference).is_some()
                })
            })
            .cloned()
            .collect();
        for reference in unneeded {
            if let Some(resource) = self.reservations.remove(&reference) {
                debug!(job_id = %self.id, reference = %reference, resource_id = %resource, "Releasing job resource");
                pool.release(&resource, &self.reservation_owner(&reference))?;
            }
        }
        Ok(())
    }

    /// Release what the run of `name` holds: its agent, and job resources no
    /// other task needs anymore.
    fn release_run(&mut self, name: &str, pool: &mut ResourcePool) -> Result<()> {
        let run = self.task_mut(name)?.run_mut();
        let run_id = run.id().clone();
        if let Some(agent) = run.take_reserved().remove(AGENT_REF) {
            pool.release(&agent, &agent_owner(&run_id))?;
        }
        self.release_unneeded(pool)
    }

    fn mark_outputs(&mut self, name: &str, mut locators: BTreeMap<String, String>) -> Result<()> {
        let outputs = self.task(name)?.def().outputs.clone();
        for output in outputs {
            let locator = locators.remove(&output);
            if let Some(product) = self.products.get_mut(&output) {
                if product.producer_finished(name, locator) {
                    info!(job_id = %self.id, product = %output, "Product available");
                }
            }
        }
        for extra in locators.keys() {
            warn!(job_id = %self.id, task = name, product = %extra, "Ignoring undeclared output");
        }
        Ok(())
    }

    /// running -> done. Updates outputs and releases resources.
    pub fn task_done(
        &mut self,
        name: &str,
        result: Option<ResultCode>,
        summary: Option<String>,
        outputs: BTreeMap<String, String>,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<TaskDone> {
        let task = self.task_mut(name)?;
        let result = task.run_mut().finish(result, summary, now)?;
        let needs_extraction = task.def().extract && result != Some(ResultCode::Error);
        self.mark_outputs(name, outputs)?;
        self.release_run(name, pool)?;
        info!(job_id = %self.id, task = name, result = ?result, "Task done");
        Ok(TaskDone {
            result,
            needs_extraction,
        })
    }

    /// Mark a running task failed with `summary`, e.g. after losing its agent.
    pub fn fail_run(
        &mut self,
        name: &str,
        summary: &str,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        warn!(job_id = %self.id, task = name, summary, "Failing run");
        self.task_done(
            name,
            Some(ResultCode::Error),
            Some(summary.to_string()),
            BTreeMap::new(),
            pool,
            now,
        )?;
        Ok(())
    }

    /// waiting -> cancelled. Consumers of the task's outputs stop waiting on it.
    pub fn cancel_task(
        &mut self,
        name: &str,
        summary: &str,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.task_mut(name)?.run_mut().cancel(summary, now)?;
        self.mark_outputs(name, BTreeMap::new())?;
        self.release_unneeded(pool)
    }

    /// Abort one task on behalf of `who`.
    pub fn abort_task(
        &mut self,
        name: &str,
        who: &str,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<AbortOutcome> {
        let outcome = self.task_mut(name)?.run_mut().request_abort(who);
        if outcome == AbortOutcome::Cancelled {
            self.cancel_task(name, &format!("cancelled by {who}"), pool, now)?;
        }
        info!(job_id = %self.id, task = name, who, outcome = ?outcome, "Abort requested");
        Ok(outcome)
    }

    /// Abort every task of the job.
    pub fn abort_all(
        &mut self,
        who: &str,
        pool: &mut ResourcePool,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, AbortOutcome>> {
        let names: Vec<String> = self.tasks.keys().cloned().collect();
        let mut outcomes = BTreeMap::new();
        for name in names {
            let outcome = self.abort_task(&name, who, pool, now)?;
            outcomes.insert(name, outcome);
        }
        Ok(outcomes)
    }

    /// Running tasks whose timeout has expired.
    pub fn timed_out_tasks(&self, now: DateTime<Utc>) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.run().is_timed_out(t.def().timeout_minutes(), now))
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Returns true if the agent executing the current run of `task` should stop.
    pub fn wants_abort(&self, task: &str, now: DateTime<Utc>) -> Result<bool> {
        let task = self.task(task)?;
        Ok(task.run().wants_abort(task.def().timeout_minutes(), now))
    }

    /// Link the run of `name` to the shadow run extracting its results.
    pub fn set_extraction(&mut self, name: &str, shadow: RunId) -> Result<()> {
        self.task_mut(name)?.run_mut().set_extraction(shadow);
        Ok(())
    }

    /// Merge the outcome of the extraction into the run of `name`.
    pub fn extraction_done(&mut self, name: &str, result: ResultCode, summary: Option<String>) -> Result<()> {
        self.task_mut(name)?.run_mut().extraction_done(result, summary)
    }

    /// Replace an `inspect` result with the reviewer's verdict.
    pub fn inspect_done(&mut self, name: &str, result: ResultCode, summary: Option<String>) -> Result<()> {
        self.task_mut(name)?.run_mut().inspect_done(result, summary)
    }

    /// Give a finished task a fresh waiting run.
    pub fn rerun_task(&mut self, name: &str, now: DateTime<Utc>) -> Result<RunId> {
        let task = self.task_mut(name)?;
        let run: &TaskRun = task.run();
        if !run.state().is_finished() {
            return Err(CoreError::InvalidStateTransition {
                run: run.id().clone(),
                operation: "rerun",
                from: run.state(),
            });
        }
        if run.extraction_pending() {
            return Err(CoreError::ExtractionPending {
                task: name.to_string(),
                shadow: run.extraction().cloned().unwrap_or_else(|| run.id().clone()),
            });
        }
        let id = task.replace_run(now).id().clone();
        info!(job_id = %self.id, task = name, run_id = %id, "Task rerun");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ReasonCategory;
    use crate::resource::{Resource, ResourceClaim};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn agent(id: &str, caps: &[&str]) -> AgentInfo {
        AgentInfo::new(id, "linux", caps.iter().copied())
    }

    fn pool_with(agents: &[&AgentInfo]) -> ResourcePool {
        let mut pool = ResourcePool::new();
        for a in agents {
            pool.add(a.to_resource()).unwrap();
        }
        pool
    }

    fn job(tasks: Vec<TaskDef>, products: Vec<ProductDef>) -> Job {
        let def = JobDefinition {
            target: "linux".to_string(),
            owner: "tester".to_string(),
            tasks,
            products,
        };
        Job::new(JobId::new("j1"), def, now()).unwrap()
    }

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let def = JobDefinition {
            target: "linux".to_string(),
            owner: String::new(),
            tasks: vec![TaskDef::new("a"), TaskDef::new("a")],
            products: vec![],
        };
        assert!(matches!(
            Job::new(JobId::new("j"), def, now()),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_build_then_test_on_two_agents() {
        let builder = agent("builder", &["gcc"]);
        let tester = agent("tester", &["python"]);
        let mut pool = pool_with(&[&builder, &tester]);
        let mut job = job(
            vec![
                TaskDef::new("build")
                    .with_output("bin")
                    .with_claim(ResourceClaim::agent_only(["gcc"])),
                TaskDef::new("test")
                    .with_input("bin")
                    .with_claim(ResourceClaim::agent_only(["python"])),
            ],
            vec![],
        );

        assert_eq!(job.assign(&tester, &mut pool, now()).unwrap(), None);
        let reason = job.wait_reason("test", &[&tester], &pool).unwrap().unwrap();
        assert_eq!(reason.category(), ReasonCategory::MissingInput);

        let build = job.assign(&builder, &mut pool, now()).unwrap().unwrap();
        assert_eq!(build.task, "build");
        assert!(!pool.get(&ResourceId::new("builder")).unwrap().is_free());

        job.task_done(
            "build",
            Some(ResultCode::Ok),
            None,
            outputs(&[("bin", "store://bin")]),
            &mut pool,
            now(),
        )
        .unwrap();
        assert!(pool.get(&ResourceId::new("builder")).unwrap().is_free());
        assert_eq!(job.product("bin").unwrap().locator(), Some("store://bin"));

        let test = job.assign(&tester, &mut pool, now()).unwrap().unwrap();
        assert_eq!(test.task, "test");
        job.task_done("test", Some(ResultCode::Warning), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        assert!(job.is_finished());
        assert_eq!(job.result(), Some(ResultCode::Warning));
    }

    #[test]
    fn test_local_group_stays_on_bound_agent() {
        let a = agent("a", &["gcc"]);
        let b = agent("b", &["gcc"]);
        let mut pool = pool_with(&[&a, &b]);
        let mut job = job(
            vec![
                TaskDef::new("build").with_output("tree"),
                TaskDef::new("check").with_input("tree"),
            ],
            vec![ProductDef::new("tree").local()],
        );

        job.assign(&a, &mut pool, now()).unwrap().unwrap();
        job.task_done("build", Some(ResultCode::Ok), None, outputs(&[("tree", "/work")]), &mut pool, now())
            .unwrap();

        assert_eq!(job.assign(&b, &mut pool, now()).unwrap(), None);
        let reason = job.blocking_reason(&[&b], &pool).unwrap();
        assert_eq!(reason.category(), ReasonCategory::BoundAgent);
        assert!(matches!(
            job.try_assign("check", &b, &mut pool, now()),
            Err(CoreError::GroupRebind { .. })
        ));

        let run = job.assign(&a, &mut pool, now()).unwrap().unwrap();
        assert_eq!(run.task, "check");
    }

    #[test]
    fn test_shared_reference_held_until_last_task_finishes() {
        let a = agent("a", &[]);
        let mut pool = pool_with(&[&a]);
        pool.add(Resource::new("rig1", "rig", ["usb"])).unwrap();
        let claim = ResourceClaim::agent_only(Vec::<String>::new())
            .with_spec(ResourceSpec::new("rig", "rig", ["usb"]))
            .unwrap();
        let mut job = job(
            vec![
                TaskDef::new("flash").with_claim(claim.clone()),
                TaskDef::new("verify").with_claim(claim).with_priority(1),
            ],
            vec![],
        );

        let first = job.assign(&a, &mut pool, now()).unwrap().unwrap();
        assert_eq!(first.task, "flash");
        assert_eq!(job.reservation("rig"), Some(&ResourceId::new("rig1")));
        job.task_done("flash", Some(ResultCode::Ok), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        assert!(!pool.get(&ResourceId::new("rig1")).unwrap().is_free());

        job.assign(&a, &mut pool, now()).unwrap().unwrap();
        job.task_done("verify", Some(ResultCode::Ok), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        assert!(pool.get(&ResourceId::new("rig1")).unwrap().is_free());
        assert_eq!(job.reservation("rig"), None);
    }

    #[test]
    fn test_deleted_reservation_reported() {
        let a = agent("a", &[]);
        let mut pool = pool_with(&[&a]);
        pool.add(Resource::new("rig1", "rig", Vec::<String>::new())).unwrap();
        let claim = ResourceClaim::agent_only(Vec::<String>::new())
            .with_spec(ResourceSpec::new("rig", "rig", Vec::<String>::new()))
            .unwrap();
        let mut job = job(
            vec![
                TaskDef::new("one").with_claim(claim.clone()),
                TaskDef::new("two").with_claim(claim).with_priority(1),
            ],
            vec![],
        );
        job.assign(&a, &mut pool, now()).unwrap().unwrap();
        job.task_done("one", Some(ResultCode::Ok), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        pool.remove(&ResourceId::new("rig1"));

        let reason = job.wait_reason("two", &[&a], &pool).unwrap().unwrap();
        assert_eq!(reason, Reason::resource_deleted(&ResourceId::new("rig1")));
        assert_eq!(job.assign(&a, &mut pool, now()).unwrap(), None);
    }

    #[test]
    fn test_missing_input_outranks_missing_capability() {
        let weak = agent("weak", &[]);
        let pool = pool_with(&[&weak]);
        let job = job(
            vec![
                TaskDef::new("build").with_output("bin"),
                TaskDef::new("test")
                    .with_input("bin")
                    .with_claim(ResourceClaim::agent_only(["gpu"])),
            ],
            vec![],
        );
        let reason = job.wait_reason("test", &[&weak], &pool).unwrap().unwrap();
        assert_eq!(reason.category(), ReasonCategory::MissingInput);
    }

    #[test]
    fn test_abort_and_cancel() {
        let a = agent("a", &[]);
        let mut pool = pool_with(&[&a]);
        let mut job = job(
            vec![
                TaskDef::new("build").with_output("bin"),
                TaskDef::new("test").with_input("bin"),
            ],
            vec![],
        );
        job.assign(&a, &mut pool, now()).unwrap().unwrap();

        let outcomes = job.abort_all("alice", &mut pool, now()).unwrap();
        assert_eq!(outcomes["build"], AbortOutcome::Requested);
        assert_eq!(outcomes["test"], AbortOutcome::Cancelled);
        assert_eq!(job.task("test").unwrap().run().state(), RunState::Cancelled);
        assert!(job.wants_abort("build", now()).unwrap());

        let done = job
            .task_done("build", Some(ResultCode::Ok), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        assert_eq!(done.result, Some(ResultCode::Error));
        assert!(job.is_finished());
    }

    #[test]
    fn test_rerun_requires_finished_run() {
        let a = agent("a", &[]);
        let mut pool = pool_with(&[&a]);
        let mut job = job(vec![TaskDef::new("t")], vec![]);
        assert!(job.rerun_task("t", now()).is_err());

        let first = job.assign(&a, &mut pool, now()).unwrap().unwrap();
        job.task_done("t", Some(ResultCode::Error), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        let second = job.rerun_task("t", now()).unwrap();
        assert_ne!(first.run_id, second);
        assert_eq!(job.task("t").unwrap().run().state(), RunState::Waiting);
    }

    #[test]
    fn test_extraction_requested_unless_error() {
        let a = agent("a", &[]);
        let mut pool = pool_with(&[&a]);
        let mut job = job(vec![TaskDef::new("t").with_extraction()], vec![]);
        job.assign(&a, &mut pool, now()).unwrap().unwrap();
        let done = job
            .task_done("t", None, None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        assert!(done.needs_extraction);

        job.extraction_done("t", ResultCode::Ok, Some("12 passed".to_string()))
            .unwrap();
        assert_eq!(job.task("t").unwrap().run().result(), Some(ResultCode::Ok));
    }

    #[test]
    fn test_rerun_waits_for_extraction() {
        let a = agent("a", &[]);
        let mut pool = pool_with(&[&a]);
        let mut job = job(vec![TaskDef::new("t").with_extraction()], vec![]);
        job.assign(&a, &mut pool, now()).unwrap().unwrap();
        job.task_done("t", Some(ResultCode::Ok), None, BTreeMap::new(), &mut pool, now())
            .unwrap();
        job.set_extraction("t", RunId::new("shadow-1")).unwrap();

        assert!(matches!(
            job.rerun_task("t", now()),
            Err(CoreError::ExtractionPending { ref task, ref shadow })
                if task == "t" && *shadow == RunId::new("shadow-1")
        ));

        job.extraction_done("t", ResultCode::Warning, None).unwrap();
        assert!(job.rerun_task("t", now()).is_ok());
    }
}
