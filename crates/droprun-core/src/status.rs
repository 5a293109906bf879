//! State enums for runs, challenge harvesting, and handoff requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a task runner.
///
/// A run starts in `Initialized` and ends in one of the terminal states
/// (`Finished`, `Errored`, `Aborted`, `Stopped`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Runner created, waiting for a start command.
    #[default]
    Initialized,
    /// Start command received; task configuration is being validated.
    Started,
    /// Session and initial proxy are being prepared.
    TaskSetup,
    /// Polling the site for product availability.
    Monitor,
    /// Polling an already-seen product that is awaiting stock.
    Restock,
    /// Rotating away from a banned proxy.
    SwapProxies,
    /// Running the site's checkout sequence.
    Checkout,
    /// Checkout succeeded.
    Finished,
    /// Run failed with an unrecoverable error.
    Errored,
    /// Run was aborted.
    Aborted,
    /// Run was stopped by an explicit stop command.
    Stopped,
}

impl TaskState {
    /// All states, in declaration order.
    pub const ALL: [TaskState; 11] = [
        Self::Initialized,
        Self::Started,
        Self::TaskSetup,
        Self::Monitor,
        Self::Restock,
        Self::SwapProxies,
        Self::Checkout,
        Self::Finished,
        Self::Errored,
        Self::Aborted,
        Self::Stopped,
    ];

    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Errored | Self::Aborted | Self::Stopped
        )
    }

    /// Returns true if the run is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true for the two polling modes.
    pub fn is_monitoring(&self) -> bool {
        matches!(self, Self::Monitor | Self::Restock)
    }

    /// Lowercase name, used in metrics labels and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::TaskSetup => "task_setup",
            Self::Monitor => "monitor",
            Self::Restock => "restock",
            Self::SwapProxies => "swap_proxies",
            Self::Checkout => "checkout",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a challenge token within one run context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarvestState {
    /// No challenge outstanding.
    #[default]
    Idle,
    /// A token has been requested and the run is waiting for it.
    Requesting,
    /// A token has been delivered and not yet consumed.
    Fulfilled,
}

/// Status of a request taken from a handoff queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for a value.
    #[default]
    Pending,
    /// A value was delivered.
    Fulfilled,
    /// The waiter withdrew.
    Cancelled,
    /// The queue was destroyed while the request was outstanding.
    Destroyed,
}

impl RequestStatus {
    /// Returns true once the request can no longer change.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = TaskState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                &TaskState::Finished,
                &TaskState::Errored,
                &TaskState::Aborted,
                &TaskState::Stopped
            ]
        );
        assert!(TaskState::Monitor.is_active());
    }

    #[test]
    fn test_state_serializes_screaming() {
        let json = serde_json::to_string(&TaskState::SwapProxies).unwrap();
        assert_eq!(json, "\"SWAP_PROXIES\"");
    }

    #[test]
    fn test_request_status_settled() {
        assert!(!RequestStatus::Pending.is_settled());
        assert!(RequestStatus::Destroyed.is_settled());
    }
}
