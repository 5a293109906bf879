//! Status events emitted by runners.

use crate::ids::{EventId, RunId, TaskId};
use crate::{CheckoutSummary, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A status event for tracking what a run is doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Task this event belongs to.
    pub task_id: TaskId,
    /// Run this event belongs to.
    pub run_id: RunId,
    /// Type of event.
    pub event_type: StatusEventType,
    /// State before the transition (state events only).
    pub previous_state: Option<TaskState>,
    /// State after the transition (state events only).
    pub state: Option<TaskState>,
    /// Human-readable message or failure reason.
    pub message: Option<String>,
    /// Checkout result (checkout events only).
    pub summary: Option<CheckoutSummary>,
    /// Unix timestamp (milliseconds) when event occurred.
    pub timestamp_ms: i64,
    /// Event-specific metadata (site_key, channel, ...).
    pub metadata: HashMap<String, String>,
}

impl StatusEvent {
    fn new(task_id: TaskId, run_id: RunId, event_type: StatusEventType) -> Self {
        Self {
            id: EventId::generate(),
            task_id,
            run_id,
            event_type,
            previous_state: None,
            state: None,
            message: None,
            summary: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            metadata: HashMap::new(),
        }
    }

    /// Create a state transition event.
    pub fn transition(
        task_id: TaskId,
        run_id: RunId,
        previous: TaskState,
        next: TaskState,
        reason: Option<String>,
    ) -> Self {
        let mut event = Self::new(task_id, run_id, StatusEventType::State);
        event.previous_state = Some(previous);
        event.state = Some(next);
        event.message = reason;
        event
    }

    /// Create a monitor progress event.
    pub fn monitor(task_id: TaskId, run_id: RunId, message: impl Into<String>) -> Self {
        let mut event = Self::new(task_id, run_id, StatusEventType::Monitor);
        event.message = Some(message.into());
        event
    }

    /// Create a checkout progress event, optionally carrying the final summary.
    pub fn checkout(
        task_id: TaskId,
        run_id: RunId,
        message: impl Into<String>,
        summary: Option<CheckoutSummary>,
    ) -> Self {
        let mut event = Self::new(task_id, run_id, StatusEventType::Checkout);
        event.message = Some(message.into());
        event.summary = summary;
        event
    }

    /// Create an event asking the harvester to start solving for this run.
    pub fn harvest_started(task_id: TaskId, run_id: RunId, site_key: &str, channel: &str) -> Self {
        let mut event = Self::new(task_id, run_id, StatusEventType::Harvest);
        event.message = Some("start".to_string());
        event
            .metadata
            .insert("site_key".to_string(), site_key.to_string());
        event
            .metadata
            .insert("channel".to_string(), channel.to_string());
        event
    }

    /// Create an event telling the harvester this run no longer needs tokens.
    pub fn harvest_stopped(task_id: TaskId, run_id: RunId) -> Self {
        let mut event = Self::new(task_id, run_id, StatusEventType::Harvest);
        event.message = Some("stop".to_string());
        event
    }

    /// Returns true for a state event that entered a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.event_type == StatusEventType::State
            && self.state.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// Type of status event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventType {
    /// State machine transition.
    State,
    /// Monitoring progress.
    Monitor,
    /// Checkout progress or result.
    Checkout,
    /// Challenge harvesting start/stop.
    Harvest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition() {
        let run_id = RunId::generate();
        let task_id = TaskId::generate();
        let event = StatusEvent::transition(
            task_id.clone(),
            run_id.clone(),
            TaskState::Monitor,
            TaskState::SwapProxies,
            None,
        );

        assert_eq!(event.run_id, run_id);
        assert_eq!(event.task_id, task_id);
        assert_eq!(event.event_type, StatusEventType::State);
        assert_eq!(event.previous_state, Some(TaskState::Monitor));
        assert_eq!(event.state, Some(TaskState::SwapProxies));
        assert!(event.timestamp_ms > 0);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_fatal_transition_carries_reason() {
        let event = StatusEvent::transition(
            TaskId::generate(),
            RunId::generate(),
            TaskState::SwapProxies,
            TaskState::Errored,
            Some("proxy pool exhausted".to_string()),
        );
        assert!(event.is_terminal());
        assert_eq!(event.message.as_deref(), Some("proxy pool exhausted"));
    }

    #[test]
    fn test_harvest_started() {
        let event =
            StatusEvent::harvest_started(TaskId::generate(), RunId::generate(), "6Lc-key", "chk");

        assert_eq!(event.event_type, StatusEventType::Harvest);
        assert_eq!(event.metadata.get("site_key"), Some(&"6Lc-key".to_string()));
        assert_eq!(event.metadata.get("channel"), Some(&"chk".to_string()));
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&StatusEventType::Checkout).unwrap();
        assert_eq!(json, "\"checkout\"");
    }
}
