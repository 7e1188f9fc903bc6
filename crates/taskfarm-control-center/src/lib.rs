//! Task Farm control center library.
//!
//! Holds the dispatch state of a build/test farm: submitted jobs, the
//! resource pool, registered agents and their shadow runs. Agents drive it
//! through the sync protocol; operators through the HTTP API.

pub mod center;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod shadow;
pub mod state;
pub mod sync;
pub mod timer;

pub use center::ControlCenter;
pub use config::Config;
pub use error::{CenterError, Result};
pub use registry::{AgentRecord, AgentRegistry, Slot};
pub use shadow::ShadowRun;
pub use state::AppState;
pub use timer::{TimerHandle, TimerService};
