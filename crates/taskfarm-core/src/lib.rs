//! Task Farm Core Domain
//!
//! This crate contains the dispatch engine with no dependencies on:
//! - Network/HTTP
//! - Storage
//! - Runtime specifics
//!
//! It covers job graphs and grouping, resource matching, the task run state
//! machine, wait diagnostics and agent liveness thresholds.

pub mod agent;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod ids;
pub mod job;
pub mod matcher;
pub mod notify;
pub mod product;
pub mod resource;
pub mod run;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use agent::{AgentInfo, SyncTimeouts};
pub use diagnostics::{top_reason, Reason, ReasonCategory};
pub use error::CoreError;
pub use graph::{GroupItem, LocalGroup, MainGroup};
pub use ids::{AgentId, JobId, ResourceId, RunId, RunRef};
pub use job::{Job, JobDefinition, TaskDone};
pub use notify::{ChangeNotifier, EventBus};
pub use product::{Product, ProductDef};
pub use resource::{Resource, ResourceClaim, ResourcePool, ResourceSpec};
pub use run::{AbortOutcome, TaskRun};
pub use status::{ConnectionStatus, ResultCode, RunState};
pub use task::{Task, TaskDef};
