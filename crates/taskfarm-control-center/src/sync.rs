//! The agent sync protocol.
//!
//! Every sync reports what the agent is running. The control center compares
//! that claim with what it believes per slot, fixes the difference, and
//! answers with continue/abort plus, for an idle agent, the next assignment.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use taskfarm_core::{AgentId, ConnectionStatus, ResourceId, RunRef};
use taskfarm_proto::{SyncAction, SyncRequest, SyncResponse};

use crate::center::ControlCenter;
use crate::error::{CenterError, Result};
use crate::registry::Slot;

impl ControlCenter {
    /// Handle one sync from an agent.
    pub fn sync(&mut self, request: SyncRequest, now: DateTime<Utc>) -> Result<SyncResponse> {
        if request.agent_id.is_empty() {
            return Err(CenterError::InvalidRequest("agent_id is required".to_string()));
        }
        let agent = AgentId::from(request.agent_id.as_str());
        let _batch = self.notifier().batch();

        let previous = self.registry().get(&agent).map(|r| r.status);
        if self.registry_mut().record_sync(&request, now) {
            let resource = self.agent(&agent)?.info.to_resource();
            if self.pool().get(&ResourceId::from(&agent)).is_none() {
                self.pool_mut().add(resource)?;
            }
        } else if matches!(previous, Some(ConnectionStatus::Warning | ConnectionStatus::Lost)) {
            info!(agent_id = %agent, "Agent reconnected");
        }
        self.mark_connected(&agent);

        let record = self.agent(&agent)?;
        let mut response = SyncResponse {
            exit: record.exit_requested,
            sync_interval_secs: self.config().sync_interval_secs,
            ..Default::default()
        };

        let execution = request.execution_run.map(RunRef::from);
        let shadow = request.shadow_run.map(RunRef::from);
        if execution.is_some() && shadow.is_some() {
            warn!(agent_id = %agent, "Agent claims an execution and a shadow run at once, suspending");
            self.set_suspended(&agent, true)?;
            response.action = SyncAction::Abort;
            return Ok(response);
        }

        let idle = execution.is_none() && shadow.is_none();
        let abort_execution = self.reconcile(&agent, Slot::Execution, execution, now)?;
        let abort_shadow = self.reconcile(&agent, Slot::Shadow, shadow, now)?;
        if abort_execution || abort_shadow {
            response.action = SyncAction::Abort;
        }
        if idle && !response.exit {
            response.assignment = self.next_assignment(&agent, now)?;
        }
        Ok(response)
    }

    /// Compare belief and claim for one slot. Returns true if the agent
    /// must abort what it runs in that slot.
    fn reconcile(
        &mut self,
        agent: &AgentId,
        slot: Slot,
        claim: Option<RunRef>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let belief = self.registry().get(agent).and_then(|r| r.belief(slot).cloned());
        match (belief, claim) {
            (None, None) => Ok(false),
            (Some(belief), Some(claim)) if belief == claim => {
                Ok(self.wants_abort(agent, slot, &claim, now))
            }
            (Some(belief), None) => {
                warn!(agent_id = %agent, slot = ?slot, run = %belief, "Agent no longer runs believed run");
                self.unwatch(agent, slot);
                self.fail_slot(slot, &belief, "agent no longer running it", now)?;
                Ok(false)
            }
            (None, Some(claim)) => {
                if self.is_live(agent, slot, &claim) {
                    info!(agent_id = %agent, slot = ?slot, run = %claim, "Adopting run reported by agent");
                    self.watch(agent, slot, claim.clone());
                    Ok(self.wants_abort(agent, slot, &claim, now))
                } else {
                    warn!(agent_id = %agent, slot = ?slot, run = %claim, "Agent runs unknown or finished run");
                    Ok(true)
                }
            }
            (Some(belief), Some(claim)) => {
                warn!(
                    agent_id = %agent,
                    slot = ?slot,
                    believed = %belief,
                    claimed = %claim,
                    "Agent runs a different run than believed"
                );
                self.unwatch(agent, slot);
                self.fail_slot(slot, &belief, "agent is running a different run", now)?;
                Ok(true)
            }
        }
    }

    fn fail_slot(&mut self, slot: Slot, run: &RunRef, summary: &str, now: DateTime<Utc>) -> Result<()> {
        match slot {
            Slot::Execution => self.fail_execution(run, summary, now),
            Slot::Shadow => self.fail_shadow(&run.run_id, summary, now),
        }
    }
}
