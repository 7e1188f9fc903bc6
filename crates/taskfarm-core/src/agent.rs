//! Agent descriptors and liveness thresholds.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{Resource, AGENT_TYPE};
use crate::{AgentId, ConnectionStatus};

/// What the dispatch engine needs to know about an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Unique agent identifier.
    pub id: AgentId,

    /// Target (platform) the agent builds and tests for.
    pub target: String,

    /// Capabilities learned at registration.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl AgentInfo {
    /// Create a new AgentInfo.
    pub fn new<I, S>(id: impl Into<AgentId>, target: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            target: target.into(),
            capabilities: caps.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the agent offers every capability in `needed`.
    pub fn has_capabilities(&self, needed: &BTreeSet<String>) -> bool {
        self.capabilities.is_superset(needed)
    }

    /// The pool resource representing this agent.
    pub fn to_resource(&self) -> Resource {
        Resource::new(&self.id, AGENT_TYPE, self.capabilities.iter().cloned())
    }
}

/// Capabilities in `needed` that none of `agents` offers. When every
/// capability is offered somewhere but no single agent has them all, the
/// whole of `needed` is returned.
pub(crate) fn missing_capabilities(needed: &BTreeSet<String>, agents: &[&AgentInfo]) -> BTreeSet<String> {
    let missing: BTreeSet<String> = needed
        .iter()
        .filter(|cap| !agents.iter().any(|a| a.capabilities.contains(*cap)))
        .cloned()
        .collect();
    if missing.is_empty() {
        needed.clone()
    } else {
        missing
    }
}

/// Liveness thresholds derived from the configured sync interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimeouts {
    /// Silence after which an agent is reported as `warning`.
    pub warn: Duration,
    /// Silence after which an agent is reported as `lost`.
    pub lost: Duration,
}

impl SyncTimeouts {
    /// Derive the thresholds from the sync interval (seconds):
    /// `warn = max(7, interval + 2)`, `lost = max(302, interval * 10 + 2)`.
    pub fn from_interval(sync_interval_secs: u64) -> Self {
        Self {
            warn: Duration::from_secs(7.max(sync_interval_secs + 2)),
            lost: Duration::from_secs(302.max(sync_interval_secs * 10 + 2)),
        }
    }

    /// Connection status of an agent that last synced at `last_sync`.
    pub fn status(&self, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ConnectionStatus {
        let Some(last_sync) = last_sync else {
            return ConnectionStatus::Unknown;
        };
        let silence = (now - last_sync).to_std().unwrap_or_default();
        if silence >= self.lost {
            ConnectionStatus::Lost
        } else if silence >= self.warn {
            ConnectionStatus::Warning
        } else {
            ConnectionStatus::Connected
        }
    }
}
