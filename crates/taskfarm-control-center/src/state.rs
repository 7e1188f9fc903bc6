//! Shared application state.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::error;

use taskfarm_core::AgentId;
use taskfarm_proto::{SyncRequest, SyncResponse};

use crate::center::ControlCenter;
use crate::config::Config;
use crate::error::Result;
use crate::timer::{TimerHandle, TimerService};

/// Shared application state.
pub struct AppState {
    pub config: Config,

    /// All dispatch state. One lock serializes requests and timer callbacks.
    pub center: Mutex<ControlCenter>,

    timers: TimerService,

    /// Per-agent timers that declare an agent lost when it stops syncing.
    lost_timers: std::sync::Mutex<HashMap<AgentId, TimerHandle>>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            center: Mutex::new(ControlCenter::new(config.clone())),
            config,
            timers: TimerService::new(),
            lost_timers: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn lost_timers(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, TimerHandle>> {
        self.lost_timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle a sync and re-arm the agent's lost timer.
    pub async fn sync(self: &Arc<Self>, request: SyncRequest) -> Result<SyncResponse> {
        let agent = AgentId::from(request.agent_id.as_str());
        let now = Utc::now();
        let response = self.center.lock().await.sync(request, now)?;
        self.arm_lost_timer(agent, now);
        Ok(response)
    }

    fn arm_lost_timer(self: &Arc<Self>, agent: AgentId, synced_at: DateTime<Utc>) {
        let state = Arc::downgrade(self);
        let timer_agent = agent.clone();
        let handle = self.timers.schedule(self.config.timeouts().lost, move || async move {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut center = state.center.lock().await;
            if let Err(e) = center.mark_agent_lost(&timer_agent, synced_at, Utc::now()) {
                error!(agent_id = %timer_agent, error = %e, "Failed to mark agent lost");
            }
        });
        // Replacing the previous handle cancels it.
        self.lost_timers().insert(agent, handle);
    }

    /// Stop tracking a deleted agent.
    pub fn forget_agent(&self, agent: &AgentId) {
        self.lost_timers().remove(agent);
    }

    /// Number of agents with an armed lost timer.
    pub fn tracked_agents(&self) -> usize {
        self.lost_timers().len()
    }

    /// Start the periodic sweep of connection status and run timeouts.
    pub fn start_sweeper(self: &Arc<Self>) -> TimerHandle {
        let state = Arc::downgrade(self);
        self.timers.every(self.config.sweep_interval(), move || {
            let state = state.clone();
            async move {
                let Some(state) = state.upgrade() else {
                    return;
                };
                let mut center = state.center.lock().await;
                center.sweep(Utc::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskfarm_core::ConnectionStatus;

    use super::*;

    fn request(agent: &str) -> SyncRequest {
        SyncRequest {
            agent_id: agent.to_string(),
            host: "host".to_string(),
            version: "1.0".to_string(),
            target: "linux".to_string(),
            capabilities: vec![],
            execution_run: None,
            shadow_run: None,
        }
    }

    async fn status_of(state: &AppState, agent: &str) -> ConnectionStatus {
        state
            .center
            .lock()
            .await
            .agent(&AgentId::new(agent))
            .map(|r| r.status)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_is_lost_when_timer_fires() {
        let state = AppState::new(Config::default());
        state.sync(request("a")).await.unwrap();
        assert_eq!(state.tracked_agents(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(status_of(&state, "a").await, ConnectionStatus::Connected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(status_of(&state, "a").await, ConnectionStatus::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_rearms_lost_timer() {
        let state = AppState::new(Config::default());
        state.sync(request("a")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(200)).await;
        state.sync(request("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(status_of(&state, "a").await, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_marks_silent_agent_lost() {
        let state = AppState::new(Config::default());
        let long_ago = Utc::now() - chrono::Duration::seconds(400);
        state.center.lock().await.sync(request("a"), long_ago).unwrap();
        let _sweeper = state.start_sweeper();

        tokio::time::sleep(state.config.sweep_interval() + Duration::from_secs(1)).await;
        assert_eq!(status_of(&state, "a").await, ConnectionStatus::Lost);
    }
}
