//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a Job.
    JobId
);

string_id!(
    /// Unique identifier for one execution attempt of a task, or of a shadow run.
    RunId
);

string_id!(
    /// Unique identifier for a registered execution agent.
    AgentId
);

string_id!(
    /// Unique identifier for a concrete resource in the pool.
    ///
    /// Agents are resources too: an agent's resource id equals its agent id.
    ResourceId
);

impl From<&AgentId> for ResourceId {
    fn from(agent: &AgentId) -> Self {
        Self(agent.as_str().to_owned())
    }
}

/// Reference to one run as reported over the sync protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunRef {
    /// Job containing the task.
    pub job_id: JobId,
    /// Task name within the job.
    pub task: String,
    /// Run identifier.
    pub run_id: RunId,
}

impl RunRef {
    /// Create a new run reference.
    pub fn new(job_id: JobId, task: impl Into<String>, run_id: RunId) -> Self {
        Self {
            job_id,
            task: task.into(),
            run_id,
        }
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.task, self.run_id)
    }
}
