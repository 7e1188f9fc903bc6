//! HTTP request handlers.

mod agents;
mod health;
mod jobs;
mod protocol;
mod resources;

pub use agents::{delete_agent, list_agents, request_exit, resume_agent, suspend_agent};
pub use health::{health_check, metrics_handler};
pub use jobs::{abort_job, abort_task, get_job, inspect_task, list_jobs, rerun_task, submit_job};
pub use protocol::{extracted, run_done, sync};
pub use resources::{add_resource, remove_resource};
