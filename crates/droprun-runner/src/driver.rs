//! Site driver capability and platform registry.
//!
//! A site driver knows how to poll and check out on one retail platform. The
//! runner only ever talks to drivers through [`SiteDriver`]; which driver a
//! task gets is decided by its platform identifier via [`DriverRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use droprun_core::{CoreError, OrderInfo, ProductInfo, Task};
use thiserror::Error;

use crate::context::RunContext;

pub mod simulated;

pub use simulated::SimulatedDriver;

/// Failures reported by a site driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Timeout, 5xx, or similar. Retried in place.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The site flagged the current proxy or session.
    #[error("Banned: {0}")]
    Banned(String),

    /// Failure that retrying cannot fix.
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// The task is not usable on this platform.
    #[error("Invalid task: {0}")]
    Config(#[from] CoreError),
}

/// Result of one availability poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    /// The product can be bought now.
    pub available: bool,

    /// The product is known but waiting on stock.
    pub restock: bool,

    /// The site flagged the current proxy.
    pub banned: bool,

    /// Details of the matched product, when found.
    pub product: Option<ProductInfo>,

    /// Optional status line for the UI.
    pub message: Option<String>,
}

impl Availability {
    pub fn available(product: ProductInfo) -> Self {
        Self {
            available: true,
            product: Some(product),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn restock() -> Self {
        Self {
            restock: true,
            ..Self::default()
        }
    }

    pub fn banned() -> Self {
        Self {
            banned: true,
            ..Self::default()
        }
    }

    /// Builder method to attach a status line.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An anti-automation challenge raised during checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Site key the solver needs.
    pub site_key: String,

    /// Channel the harvester uses to correlate its answer with this run.
    pub channel: String,
}

/// Result of one pass through the checkout sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutOutcome {
    pub success: bool,
    pub order: Option<OrderInfo>,
    pub challenge: Option<Challenge>,
    pub message: Option<String>,
}

impl CheckoutOutcome {
    pub fn success(order: Option<OrderInfo>) -> Self {
        Self {
            success: true,
            order,
            ..Self::default()
        }
    }

    pub fn challenge(challenge: Challenge) -> Self {
        Self {
            challenge: Some(challenge),
            ..Self::default()
        }
    }

    /// A recoverable failure (declined, out of stock at payment, ...).
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Monitor and checkout operations for one retail platform.
#[async_trait]
pub trait SiteDriver: Send + Sync {
    /// Platform identifier this driver serves.
    fn platform(&self) -> &str;

    /// Check that a task carries what this platform needs.
    fn validate(&self, task: &Task) -> Result<(), DriverError> {
        task.validate()?;
        Ok(())
    }

    /// Poll the site for the task's product.
    async fn check_availability(&self, ctx: &RunContext) -> Result<Availability, DriverError>;

    /// Run the checkout sequence. Reads `ctx.captcha_token()` when retrying
    /// after a challenge.
    async fn checkout(&self, ctx: &RunContext) -> Result<CheckoutOutcome, DriverError>;

    /// Drop any per-run state. Called once when the run reaches a terminal
    /// state.
    fn release(&self, _ctx: &RunContext) {}
}

/// Maps platform identifiers to driver instances.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn SiteDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its platform id, replacing any previous one.
    pub fn register(&mut self, driver: Arc<dyn SiteDriver>) {
        self.drivers.insert(driver.platform().to_string(), driver);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_driver(mut self, driver: Arc<dyn SiteDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn SiteDriver>> {
        self.drivers.get(platform).cloned()
    }

    /// Look up the driver for `platform` or report it as unknown.
    pub fn resolve(&self, platform: &str) -> Result<Arc<dyn SiteDriver>, CoreError> {
        self.get(platform)
            .ok_or_else(|| CoreError::UnknownPlatform(platform.to_string()))
    }

    pub fn platforms(&self) -> Vec<&str> {
        let mut platforms: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        platforms.sort_unstable();
        platforms
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
