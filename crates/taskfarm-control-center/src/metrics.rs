//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use taskfarm_core::{ConnectionStatus, RunState};

use crate::center::ControlCenter;
use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let center = state.center.lock().await;
    render(&center)
}

/// Format the metrics of `center`.
pub fn render(center: &ControlCenter) -> String {
    let mut output = String::new();

    collect_agent_metrics(center, &mut output);
    collect_run_metrics(center, &mut output);
    collect_notification_metrics(center, &mut output);

    output
}

/// Collect agent metrics by connection status.
fn collect_agent_metrics(center: &ControlCenter, output: &mut String) {
    let mut unknown = 0u64;
    let mut connected = 0u64;
    let mut warning = 0u64;
    let mut lost = 0u64;
    let mut suspended = 0u64;

    for agent in center.registry().iter() {
        match agent.status {
            ConnectionStatus::Unknown => unknown += 1,
            ConnectionStatus::Connected => connected += 1,
            ConnectionStatus::Warning => warning += 1,
            ConnectionStatus::Lost => lost += 1,
        }
        if agent.suspended {
            suspended += 1;
        }
    }

    writeln!(
        output,
        "# HELP taskfarm_agents Number of registered agents by connection status"
    )
    .ok();
    writeln!(output, "# TYPE taskfarm_agents gauge").ok();
    writeln!(output, "taskfarm_agents{{status=\"unknown\"}} {unknown}").ok();
    writeln!(output, "taskfarm_agents{{status=\"connected\"}} {connected}").ok();
    writeln!(output, "taskfarm_agents{{status=\"warning\"}} {warning}").ok();
    writeln!(output, "taskfarm_agents{{status=\"lost\"}} {lost}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskfarm_agents_suspended Number of suspended agents"
    )
    .ok();
    writeln!(output, "# TYPE taskfarm_agents_suspended gauge").ok();
    writeln!(output, "taskfarm_agents_suspended {suspended}").ok();
}

/// Collect current task runs by state.
fn collect_run_metrics(center: &ControlCenter, output: &mut String) {
    let mut waiting = 0u64;
    let mut running = 0u64;
    let mut done = 0u64;
    let mut cancelled = 0u64;

    let runs = center.jobs().flat_map(|job| job.tasks().map(|t| t.run().state()));
    for state in runs {
        match state {
            RunState::Waiting => waiting += 1,
            RunState::Running => running += 1,
            RunState::Done => done += 1,
            RunState::Cancelled => cancelled += 1,
        }
    }
    let shadows_running = center
        .shadows()
        .filter(|s| s.state() == RunState::Running)
        .count();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskfarm_task_runs Current task runs by state"
    )
    .ok();
    writeln!(output, "# TYPE taskfarm_task_runs gauge").ok();
    writeln!(output, "taskfarm_task_runs{{state=\"waiting\"}} {waiting}").ok();
    writeln!(output, "taskfarm_task_runs{{state=\"running\"}} {running}").ok();
    writeln!(output, "taskfarm_task_runs{{state=\"done\"}} {done}").ok();
    writeln!(
        output,
        "taskfarm_task_runs{{state=\"cancelled\"}} {cancelled}"
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskfarm_shadow_runs_running Shadow runs currently extracting results"
    )
    .ok();
    writeln!(output, "# TYPE taskfarm_shadow_runs_running gauge").ok();
    writeln!(output, "taskfarm_shadow_runs_running {shadows_running}").ok();
}

fn collect_notification_metrics(center: &ControlCenter, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskfarm_job_notifications_total Job change notifications delivered"
    )
    .ok();
    writeln!(output, "# TYPE taskfarm_job_notifications_total counter").ok();
    writeln!(
        output,
        "taskfarm_job_notifications_total {}",
        center.notifier().fired()
    )
    .ok();
}
