//! Runner configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Engine-wide configuration shared by every runner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Transient monitor failures tolerated in a row.
    pub max_monitor_retries: u32,

    /// Recoverable checkout failures tolerated in a row.
    pub max_checkout_retries: u32,

    /// Maximum wait for a harvested challenge token (milliseconds).
    pub checkout_timeout_ms: u64,

    /// How many recently banned proxies a task avoids.
    pub banned_history_capacity: usize,

    /// Capacity of the status event broadcast channel.
    pub event_buffer: usize,

    /// Per-request timeout on a run's HTTP session (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_monitor_retries: 5,
            max_checkout_retries: 3,
            checkout_timeout_ms: 120_000,
            banned_history_capacity: 10,
            event_buffer: 1024,
            request_timeout_ms: 60_000,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config from '{}': {}", path.display(), e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: RunnerConfig = serde_json::from_str(r#"{"max_checkout_retries": 9}"#).unwrap();
        assert_eq!(config.max_checkout_retries, 9);
        assert_eq!(config.max_monitor_retries, 5);
        assert_eq!(config.checkout_timeout(), Duration::from_secs(120));
    }
}
