//! Simulated platform driver.
//!
//! Stands in for a real retailer so a task file can be exercised end to end:
//! reports the product unavailable for a number of polls, then available,
//! optionally raises one challenge at checkout, then places a fake order.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use droprun_core::{OrderInfo, ProductInfo, ProductSelector, RunId, Task};
use rand::Rng;
use tracing::debug;

use super::{Availability, Challenge, CheckoutOutcome, DriverError, SiteDriver};
use crate::context::RunContext;

/// Site key reported when the task does not configure one.
const DEFAULT_SITE_KEY: &str = "simulated-site-key";

/// Driver for the `simulated` platform.
pub struct SimulatedDriver {
    polls_until_live: u32,
    require_challenge: bool,
    latency_ms: Range<u64>,
    polls: Mutex<HashMap<RunId, u32>>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(3, false)
    }
}

impl SimulatedDriver {
    /// Create a driver that goes live after `polls_until_live` polls.
    pub fn new(polls_until_live: u32, require_challenge: bool) -> Self {
        Self {
            polls_until_live,
            require_challenge,
            latency_ms: 50..250,
            polls: Mutex::new(HashMap::new()),
        }
    }

    /// Builder method to set the simulated request latency.
    pub fn with_latency(mut self, latency_ms: Range<u64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    async fn simulate_latency(&self) {
        if self.latency_ms.is_empty() {
            return;
        }
        let millis = rand::thread_rng().gen_range(self.latency_ms.clone());
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Runs with a poll counter.
    pub fn tracked_runs(&self) -> usize {
        self.polls.lock().map(|polls| polls.len()).unwrap_or_default()
    }

    fn product_for(task: &Task) -> ProductInfo {
        let name = match &task.product {
            ProductSelector::Keywords { positive, .. } => positive.join(" "),
            ProductSelector::Url { url } => url.clone(),
            ProductSelector::Variant { id } => format!("Variant {id}"),
        };
        ProductInfo {
            name,
            url: Some(task.site.url.clone()),
            price: Some("$120.00".to_string()),
            size: task.sizes.first().cloned(),
            image: None,
        }
    }
}

#[async_trait]
impl SiteDriver for SimulatedDriver {
    fn platform(&self) -> &str {
        "simulated"
    }

    async fn check_availability(&self, ctx: &RunContext) -> Result<Availability, DriverError> {
        self.simulate_latency().await;

        let polls = {
            let mut polls = self
                .polls
                .lock()
                .map_err(|_| DriverError::Fatal("poll counter poisoned".to_string()))?;
            let count = polls.entry(ctx.id().clone()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(run_id = %ctx.id(), polls, "Simulated availability poll");

        if polls > self.polls_until_live {
            Ok(Availability::available(Self::product_for(ctx.task())).with_message("Product live"))
        } else {
            Ok(Availability::unavailable().with_message("Waiting for product"))
        }
    }

    async fn checkout(&self, ctx: &RunContext) -> Result<CheckoutOutcome, DriverError> {
        self.simulate_latency().await;

        if self.require_challenge && ctx.captcha_token().is_none() {
            let site_key = ctx
                .task()
                .site
                .site_key
                .clone()
                .unwrap_or_else(|| DEFAULT_SITE_KEY.to_string());
            return Ok(CheckoutOutcome::challenge(Challenge {
                site_key,
                channel: "checkout".to_string(),
            }));
        }

        let number = rand::thread_rng().gen_range(100_000..1_000_000u32);
        Ok(CheckoutOutcome::success(Some(OrderInfo {
            number: format!("#{number}"),
            url: None,
        })))
    }

    fn release(&self, ctx: &RunContext) {
        if let Ok(mut polls) = self.polls.lock() {
            polls.remove(ctx.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use droprun_core::SiteDescriptor;
    use tokio_util::sync::CancellationToken;

    fn context(site_key: Option<&str>) -> RunContext {
        let task = Task::new(
            "simulated",
            SiteDescriptor {
                name: "Shop".to_string(),
                url: "https://shop.test".to_string(),
                site_key: site_key.map(str::to_string),
            },
            ProductSelector::Keywords {
                positive: vec!["dunk".to_string(), "low".to_string()],
                negative: vec![],
            },
            "main",
        )
        .with_size("9.5");
        RunContext::new(RunId::generate(), Arc::new(task), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_goes_live_after_configured_polls() {
        let driver = SimulatedDriver::new(2, false).with_latency(0..0);
        let ctx = context(None);

        assert!(!driver.check_availability(&ctx).await.unwrap().available);
        assert!(!driver.check_availability(&ctx).await.unwrap().available);
        let live = driver.check_availability(&ctx).await.unwrap();
        assert!(live.available);
        let product = live.product.unwrap();
        assert_eq!(product.name, "dunk low");
        assert_eq!(product.size.as_deref(), Some("9.5"));

        // Counters are per run.
        let other = context(None);
        assert!(!driver.check_availability(&other).await.unwrap().available);
    }

    #[tokio::test]
    async fn test_release_forgets_run() {
        let driver = SimulatedDriver::new(1, false).with_latency(0..0);
        let ctx = context(None);
        driver.check_availability(&ctx).await.unwrap();
        assert_eq!(driver.tracked_runs(), 1);

        driver.release(&ctx);
        assert_eq!(driver.tracked_runs(), 0);
        // The run starts over if it polls again.
        assert!(!driver.check_availability(&ctx).await.unwrap().available);
    }

    #[tokio::test]
    async fn test_challenge_until_token_present() {
        let driver = SimulatedDriver::new(0, true).with_latency(0..0);
        let mut ctx = context(Some("site-key-1"));

        let first = driver.checkout(&ctx).await.unwrap();
        assert!(!first.success);
        let challenge = first.challenge.unwrap();
        assert_eq!(challenge.site_key, "site-key-1");
        assert_eq!(challenge.channel, "checkout");

        ctx.fulfil_token("tok".to_string());
        let second = driver.checkout(&ctx).await.unwrap();
        assert!(second.success);
        assert!(second.order.unwrap().number.starts_with('#'));
    }

    #[tokio::test]
    async fn test_default_site_key() {
        let driver = SimulatedDriver::new(0, true).with_latency(0..0);
        let outcome = driver.checkout(&context(None)).await.unwrap();
        assert_eq!(outcome.challenge.unwrap().site_key, DEFAULT_SITE_KEY);
    }
}
