//! Prometheus metrics collection and formatting.
//!
//! This module renders manager state in Prometheus text exposition format.

use std::fmt::Write;

use droprun_core::TaskState;

use crate::manager::TaskManager;

/// Collect all metrics from the manager and format as Prometheus text.
pub async fn collect_metrics(manager: &TaskManager) -> String {
    let mut output = String::new();
    let states = manager.states().await;

    let configured = states.len();
    let idle = states.iter().filter(|(_, s)| s.is_none()).count();

    writeln!(
        output,
        "# HELP droprun_tasks_configured Number of tasks registered with the manager"
    )
    .ok();
    writeln!(output, "# TYPE droprun_tasks_configured gauge").ok();
    writeln!(output, "droprun_tasks_configured {configured}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP droprun_tasks_idle Number of tasks that have not been started"
    )
    .ok();
    writeln!(output, "# TYPE droprun_tasks_idle gauge").ok();
    writeln!(output, "droprun_tasks_idle {idle}").ok();

    collect_state_metrics(&states, &mut output);
    output
}

/// Latest-run state of every started task.
fn collect_state_metrics<K>(states: &[(K, Option<TaskState>)], output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP droprun_runs Number of task runs by state of the latest run"
    )
    .ok();
    writeln!(output, "# TYPE droprun_runs gauge").ok();

    for state in TaskState::ALL {
        let count = states.iter().filter(|(_, s)| *s == Some(state)).count();
        writeln!(output, "droprun_runs{{state=\"{}\"}} {count}", state.as_str()).ok();
    }
}
