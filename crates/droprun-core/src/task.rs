//! Task configuration and persisted task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, OrderInfo, Proxy, TaskId, TaskState};

/// The retail site a task targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDescriptor {
    /// Display name of the site.
    pub name: String,

    /// Base URL of the storefront.
    pub url: String,

    /// Challenge site key, when the site is known to require one.
    #[serde(default)]
    pub site_key: Option<String>,
}

/// How a task identifies the product it wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductSelector {
    /// Match product titles against keyword lists.
    Keywords {
        positive: Vec<String>,
        #[serde(default)]
        negative: Vec<String>,
    },
    /// A direct product page URL.
    Url { url: String },
    /// A platform-specific variant id.
    Variant { id: String },
}

impl ProductSelector {
    fn is_empty(&self) -> bool {
        match self {
            Self::Keywords { positive, .. } => positive.iter().all(|k| k.trim().is_empty()),
            Self::Url { url } => url.trim().is_empty(),
            Self::Variant { id } => id.trim().is_empty(),
        }
    }
}

/// Immutable configuration of one task.
///
/// The runner never mutates a `Task`; the fields that change during a run
/// (active proxy, delays) are copied into the run context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    #[serde(default = "TaskId::generate")]
    pub id: TaskId,

    /// Platform identifier used to pick a site driver.
    pub platform: String,

    /// Target site.
    pub site: SiteDescriptor,

    /// Product to buy.
    pub product: ProductSelector,

    /// Acceptable sizes; empty means any size.
    #[serde(default)]
    pub sizes: Vec<String>,

    /// Billing/shipping profile reference.
    pub profile: String,

    /// Optional site account reference.
    #[serde(default)]
    pub account: Option<String>,

    /// Raw proxy strings for this task's pool.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Delay between availability polls, in milliseconds.
    #[serde(default = "default_monitor_delay_ms")]
    pub monitor_delay_ms: u64,

    /// Delay before retrying after an error, in milliseconds.
    #[serde(default = "default_error_delay_ms")]
    pub error_delay_ms: u64,
}

fn default_monitor_delay_ms() -> u64 {
    3_500
}

fn default_error_delay_ms() -> u64 {
    3_500
}

impl Task {
    /// Create a new Task with default delays and no proxies.
    pub fn new(
        platform: impl Into<String>,
        site: SiteDescriptor,
        product: ProductSelector,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            platform: platform.into(),
            site,
            product,
            sizes: Vec::new(),
            profile: profile.into(),
            account: None,
            proxies: Vec::new(),
            monitor_delay_ms: default_monitor_delay_ms(),
            error_delay_ms: default_error_delay_ms(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to add a size.
    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.sizes.push(size.into());
        self
    }

    /// Builder method to add a raw proxy string.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxies.push(proxy.into());
        self
    }

    /// Builder method to set both delays.
    pub fn with_delays(mut self, monitor_delay_ms: u64, error_delay_ms: u64) -> Self {
        self.monitor_delay_ms = monitor_delay_ms;
        self.error_delay_ms = error_delay_ms;
        self
    }

    /// Check the fields every platform requires.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.platform.trim().is_empty() {
            return Err(CoreError::MissingField("platform"));
        }
        if self.site.url.trim().is_empty() {
            return Err(CoreError::MissingField("site.url"));
        }
        if self.product.is_empty() {
            return Err(CoreError::MissingField("product"));
        }
        if self.profile.trim().is_empty() {
            return Err(CoreError::MissingField("profile"));
        }
        self.parsed_proxies()?;
        Ok(())
    }

    /// Parse the proxy pool, dropping entries that mean "no proxy".
    pub fn parsed_proxies(&self) -> Result<Vec<Proxy>, CoreError> {
        let mut proxies = Vec::with_capacity(self.proxies.len());
        for raw in &self.proxies {
            if let Some(proxy) = Proxy::parse(raw)? {
                if !proxies.iter().any(|p: &Proxy| p.id == proxy.id) {
                    proxies.push(proxy);
                }
            }
        }
        Ok(proxies)
    }
}

/// What the store keeps for a task: its configuration and last outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task configuration.
    pub task: Task,

    /// Last state reported by a run of this task.
    pub last_state: TaskState,

    /// Reason attached to the last fatal transition.
    #[serde(default)]
    pub reason: Option<String>,

    /// Order placed by the last successful run.
    #[serde(default)]
    pub order: Option<OrderInfo>,

    /// When this record was last written.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a record for a task that has not run yet.
    pub fn new(task: Task) -> Self {
        Self {
            task,
            last_state: TaskState::Initialized,
            reason: None,
            order: None,
            updated_at: Utc::now(),
        }
    }

    /// Record a state reported by a run.
    pub fn update(&mut self, state: TaskState, reason: Option<String>) {
        self.last_state = state;
        self.reason = reason;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(
            "shopify",
            SiteDescriptor {
                name: "Kith".to_string(),
                url: "https://kith.com".to_string(),
                site_key: None,
            },
            ProductSelector::Keywords {
                positive: vec!["dunk".to_string()],
                negative: vec![],
            },
            "main-profile",
        )
    }

    #[test]
    fn test_valid_task() {
        let task = sample_task().with_size("10").with_proxy("10.0.0.1:8080");
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_missing_profile_names_field() {
        let mut task = sample_task();
        task.profile = String::new();
        let err = task.validate().unwrap_err();
        assert_eq!(err, CoreError::MissingField("profile"));
        assert_eq!(err.field(), "profile");
    }

    #[test]
    fn test_empty_keywords_rejected() {
        let mut task = sample_task();
        task.product = ProductSelector::Keywords {
            positive: vec![" ".to_string()],
            negative: vec![],
        };
        assert_eq!(task.validate(), Err(CoreError::MissingField("product")));
    }

    #[test]
    fn test_bad_proxy_rejected() {
        let task = sample_task().with_proxy("10.0.0.1:notaport");
        assert!(matches!(task.validate(), Err(CoreError::InvalidProxy(_))));
    }

    #[test]
    fn test_parsed_proxies_skips_localhost_and_duplicates() {
        let task = sample_task()
            .with_proxy("localhost")
            .with_proxy("10.0.0.1:8080")
            .with_proxy("10.0.0.1:8080")
            .with_proxy("10.0.0.2:8080");
        let proxies = task.parsed_proxies().unwrap();
        assert_eq!(proxies.len(), 2);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "platform": "shopify",
            "site": {"name": "Kith", "url": "https://kith.com"},
            "product": {"type": "url", "url": "https://kith.com/products/x"},
            "profile": "p1"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.monitor_delay_ms, 3_500);
        assert!(task.proxies.is_empty());
        assert!(!task.id.as_str().is_empty());
    }

    #[test]
    fn test_record_update() {
        let mut record = TaskRecord::new(sample_task());
        assert_eq!(record.last_state, TaskState::Initialized);
        record.update(TaskState::Errored, Some("proxy pool exhausted".to_string()));
        assert_eq!(record.last_state, TaskState::Errored);
        assert_eq!(record.reason.as_deref(), Some("proxy pool exhausted"));
    }
}
