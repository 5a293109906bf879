//! Event output for the `droprun` binary.

use std::io::{self, Write};

use chrono::{TimeZone, Utc};
use droprun_core::{StatusEvent, StatusEventType};

/// How events are written to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// One human-readable line per event.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Render an event for `mode`.
pub fn format_event(event: &StatusEvent, mode: OutputMode) -> Option<String> {
    match mode {
        OutputMode::Json => serde_json::to_string(event).ok(),
        OutputMode::Text => Some(format_text(event)),
    }
}

fn format_text(event: &StatusEvent) -> String {
    let time = Utc
        .timestamp_millis_opt(event.timestamp_ms)
        .single()
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_default();
    let message = event.message.as_deref().unwrap_or_default();

    match event.event_type {
        StatusEventType::State => {
            let from = event.previous_state.map(|s| s.as_str()).unwrap_or("?");
            let to = event.state.map(|s| s.as_str()).unwrap_or("?");
            if message.is_empty() {
                format!("{time} [{}] {from} -> {to}", event.task_id)
            } else {
                format!("{time} [{}] {from} -> {to} ({message})", event.task_id)
            }
        }
        StatusEventType::Harvest => {
            let channel = event.metadata.get("channel").map(String::as_str).unwrap_or("-");
            format!(
                "{time} [{}] harvest {message} run={} channel={channel}",
                event.task_id, event.run_id
            )
        }
        StatusEventType::Monitor | StatusEventType::Checkout => match &event.summary {
            Some(summary) => format!("{time} [{}] {message}\n{}", event.task_id, summary.render()),
            None => format!("{time} [{}] {message}", event.task_id),
        },
    }
}

/// Write an event line to stdout.
pub fn emit(event: &StatusEvent, mode: OutputMode) {
    if let Some(line) = format_event(event, mode) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}
