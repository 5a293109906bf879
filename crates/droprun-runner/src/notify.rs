//! Checkout notification sinks.

use async_trait::async_trait;
use droprun_core::{CheckoutSummary, TaskId};
use tracing::{info, warn};

/// Receives checkout summaries fanned in by the manager.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn notify(&self, task_id: &TaskId, summary: &CheckoutSummary);
}

/// Logs each summary through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, task_id: &TaskId, summary: &CheckoutSummary) {
        let text = summary.render();
        if summary.success {
            info!(task_id = %task_id, site = %summary.site, "{text}");
        } else {
            warn!(task_id = %task_id, site = %summary.site, "{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_sink_accepts_summary() {
        let summary = CheckoutSummary {
            success: true,
            product: "Dunk Low".to_string(),
            price: Some("$110.00".to_string()),
            site: "Test Shop".to_string(),
            profile: "main".to_string(),
            size: Some("10".to_string()),
            image: None,
            order: None,
        };
        let sink = TracingSink;
        assert_eq!(sink.name(), "tracing");
        sink.notify(&TaskId::new("t1"), &summary).await;
    }
}
