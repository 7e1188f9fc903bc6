//! Registered agents and what the control center believes they run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use taskfarm_core::{AgentId, AgentInfo, ConnectionStatus, RunRef};
use taskfarm_proto::SyncRequest;

/// Which of an agent's two run slots is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Execution,
    Shadow,
}

/// Subscription of one agent slot to the run it is believed to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunObserver {
    pub agent: AgentId,
    pub slot: Slot,
}

/// A registered execution agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub info: AgentInfo,
    pub host: String,
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
    pub suspended: bool,
    pub exit_requested: bool,
    /// Execution run the agent is believed to work on.
    pub execution: Option<RunRef>,
    /// Shadow run the agent is believed to work on.
    pub shadow: Option<RunRef>,
}

impl AgentRecord {
    fn new(request: &SyncRequest, now: DateTime<Utc>) -> Self {
        Self {
            info: AgentInfo::from(request),
            host: request.host.clone(),
            version: request.version.clone(),
            registered_at: now,
            last_sync: None,
            status: ConnectionStatus::Unknown,
            suspended: false,
            exit_requested: false,
            execution: None,
            shadow: None,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.info.id
    }

    pub fn belief(&self, slot: Slot) -> Option<&RunRef> {
        match slot {
            Slot::Execution => self.execution.as_ref(),
            Slot::Shadow => self.shadow.as_ref(),
        }
    }

    pub(crate) fn belief_mut(&mut self, slot: Slot) -> &mut Option<RunRef> {
        match slot {
            Slot::Execution => &mut self.execution,
            Slot::Shadow => &mut self.shadow,
        }
    }

    /// Returns true if the agent may be handed new work.
    pub fn accepts_work(&self) -> bool {
        !self.suspended && !self.exit_requested && self.status.is_healthy()
    }
}

/// All registered agents.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent on first contact, otherwise refresh host and
    /// version. Returns true for a new registration.
    ///
    /// Target and capabilities are learned at registration only.
    pub fn record_sync(&mut self, request: &SyncRequest, now: DateTime<Utc>) -> bool {
        let id = AgentId::from(request.agent_id.as_str());
        let registered = match self.agents.get_mut(&id) {
            Some(record) => {
                record.host.clone_from(&request.host);
                record.version.clone_from(&request.version);
                false
            }
            None => {
                info!(
                    agent_id = %id,
                    target = %request.target,
                    host = %request.host,
                    "Agent registered"
                );
                self.agents.insert(id.clone(), AgentRecord::new(request, now));
                true
            }
        };
        if let Some(record) = self.agents.get_mut(&id) {
            record.last_sync = Some(now);
            record.status = ConnectionStatus::Connected;
        }
        registered
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut AgentRecord> {
        self.agents.get_mut(id)
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<AgentRecord> {
        self.agents.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
