//! Converters between wire types and domain types.

use crate::pb;
use taskfarm_core::error::Result;
use taskfarm_core::{
    AgentInfo, Job, JobId, ResourcePool, ResultCode, RunId, RunRef,
};

// ============================================================================
// ResultCode conversions
// ============================================================================

impl From<ResultCode> for pb::ResultCode {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Ok => pb::ResultCode::Ok,
            ResultCode::Warning => pb::ResultCode::Warning,
            ResultCode::Inspect => pb::ResultCode::Inspect,
            ResultCode::Error => pb::ResultCode::Error,
            ResultCode::Cancelled => pb::ResultCode::Cancelled,
        }
    }
}

impl From<pb::ResultCode> for ResultCode {
    fn from(code: pb::ResultCode) -> Self {
        match code {
            pb::ResultCode::Ok => ResultCode::Ok,
            pb::ResultCode::Warning => ResultCode::Warning,
            pb::ResultCode::Inspect => ResultCode::Inspect,
            pb::ResultCode::Error => ResultCode::Error,
            pb::ResultCode::Cancelled => ResultCode::Cancelled,
        }
    }
}

// ============================================================================
// RunRef conversions
// ============================================================================

impl From<RunRef> for pb::RunRef {
    fn from(run: RunRef) -> Self {
        Self {
            job_id: run.job_id.into_inner(),
            task: run.task,
            run_id: run.run_id.into_inner(),
        }
    }
}

impl From<pb::RunRef> for RunRef {
    fn from(run: pb::RunRef) -> Self {
        RunRef::new(JobId::from(run.job_id), run.task, RunId::from(run.run_id))
    }
}

// ============================================================================
// Registration
// ============================================================================

impl From<&pb::SyncRequest> for AgentInfo {
    fn from(request: &pb::SyncRequest) -> Self {
        AgentInfo::new(
            request.agent_id.as_str(),
            request.target.as_str(),
            request.capabilities.iter().cloned(),
        )
    }
}

// ============================================================================
// Assignments
// ============================================================================

fn input_locators(job: &Job, task: &str) -> Result<std::collections::BTreeMap<String, pb::InputLocator>> {
    let def = job.task(task)?.def();
    Ok(def
        .inputs
        .iter()
        .map(|name| {
            let locator = job
                .product(name)
                .map(|p| pb::InputLocator {
                    locator: p.locator().map(str::to_string),
                    locators: p.locators().clone(),
                })
                .unwrap_or_default();
            (name.clone(), locator)
        })
        .collect())
}

/// Work package for the current run of `task`, with locators of the
/// resources it reserved.
pub fn execution_assignment(job: &Job, task: &str, pool: &ResourcePool) -> Result<pb::Assignment> {
    let t = job.task(task)?;
    let resources = t
        .run()
        .reserved()
        .iter()
        .filter_map(|(reference, id)| {
            pool.get(id).map(|resource| {
                (
                    reference.clone(),
                    pb::ResourceLocator {
                        id: id.to_string(),
                        res_type: resource.res_type.clone(),
                        locator: resource.locator.clone(),
                    },
                )
            })
        })
        .collect();

    Ok(pb::Assignment {
        kind: pb::AssignmentKind::Execution,
        job_id: job.id().to_string(),
        task: task.to_string(),
        run_id: t.run().id().to_string(),
        resources,
        parameters: t.def().parameters.clone(),
        inputs: input_locators(job, task)?,
        outputs: t.def().outputs.iter().cloned().collect(),
    })
}

/// Work package for the shadow run `shadow` extracting the results of `task`.
///
/// The outputs the execution produced are handed over as inputs.
pub fn extraction_assignment(job: &Job, task: &str, shadow: &RunId) -> Result<pb::Assignment> {
    let t = job.task(task)?;
    let inputs = t
        .def()
        .outputs
        .iter()
        .map(|name| {
            let locator = job
                .product(name)
                .and_then(|p| match p.locators().get(task) {
                    Some(own) => Some(own.clone()),
                    None => p.locator().map(str::to_string),
                });
            (
                name.clone(),
                pb::InputLocator {
                    locator,
                    ..Default::default()
                },
            )
        })
        .collect();

    Ok(pb::Assignment {
        kind: pb::AssignmentKind::Extraction,
        job_id: job.id().to_string(),
        task: task.to_string(),
        run_id: shadow.to_string(),
        resources: Default::default(),
        parameters: t.def().parameters.clone(),
        inputs,
        outputs: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskfarm_core::{JobDefinition, ProductDef, TaskDef};

    #[test]
    fn test_result_code_roundtrip() {
        let codes = [
            ResultCode::Ok,
            ResultCode::Warning,
            ResultCode::Inspect,
            ResultCode::Error,
            ResultCode::Cancelled,
        ];

        for code in codes {
            let proto: pb::ResultCode = code.into();
            let back: ResultCode = proto.into();
            assert_eq!(code, back);
        }
    }

    #[test]
    fn test_sync_request_wire_shape() {
        let json = r#"{
            "agent_id": "a1",
            "target": "linux",
            "capabilities": ["gcc"],
            "execution_run": {"job_id": "j1", "task": "build", "run_id": "r1"}
        }"#;
        let request: pb::SyncRequest = serde_json::from_str(json).unwrap();
        assert!(request.shadow_run.is_none());

        let run: RunRef = request.execution_run.clone().unwrap().into();
        assert_eq!(run.to_string(), "j1/build/r1");

        let info = AgentInfo::from(&request);
        assert_eq!(info.id.as_str(), "a1");
        assert!(info.capabilities.contains("gcc"));
    }

    #[test]
    fn test_execution_assignment_carries_inputs() {
        let def = JobDefinition {
            target: "linux".to_string(),
            owner: String::new(),
            tasks: vec![TaskDef::new("test")
                .with_input("src")
                .with_output("report")
                .with_parameter("suite", "smoke")],
            products: vec![ProductDef::new("src").with_locator("git://repo")],
        };
        let job = Job::new(JobId::new("j1"), def, Utc::now()).unwrap();
        let assignment = execution_assignment(&job, "test", &ResourcePool::new()).unwrap();

        assert_eq!(assignment.kind, pb::AssignmentKind::Execution);
        assert_eq!(assignment.inputs["src"].locator.as_deref(), Some("git://repo"));
        assert_eq!(assignment.parameters["suite"], "smoke");
        assert_eq!(assignment.outputs, vec!["report".to_string()]);

        let json = serde_json::to_value(&assignment).unwrap();
        assert_eq!(json["kind"], "execution");
    }
}
