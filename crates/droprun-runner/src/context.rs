//! Mutable state of one run, threaded through every step.

use std::sync::Arc;
use std::time::Duration;

use droprun_core::{HarvestState, ProductInfo, Proxy, RunId, Task};
use tokio_util::sync::CancellationToken;

use crate::handoff::{AsyncHandoffQueue, HandoffRequest};
use crate::session::Session;

/// Reason used when a run's outstanding token wait is cancelled by stop/abort.
pub const ABORTED_REASON: &str = "aborted";

/// Per-run state bag.
///
/// Exclusively owned by one runner for the lifetime of one run and dropped
/// when the runner reaches a terminal state. The task configuration itself is
/// shared read-only; anything that changes during the run lives here.
#[derive(Debug)]
pub struct RunContext {
    id: RunId,
    ids: Vec<RunId>,
    task: Arc<Task>,

    proxy: Option<Proxy>,
    last_proxy: Option<Proxy>,
    session: Option<Session>,

    cancel: CancellationToken,

    harvest_state: HarvestState,
    captcha_request: Option<HandoffRequest<String>>,
    captcha_queue: Option<AsyncHandoffQueue<String>>,
    captcha_token: Option<String>,
    stale_tokens: bool,

    monitor_delay: Duration,
    error_delay: Duration,
    monitor_failures: u32,
    checkout_failures: u32,

    product: Option<ProductInfo>,
    message: Option<String>,
}

impl RunContext {
    /// Create a context for a new run of `task`.
    pub fn new(id: RunId, task: Arc<Task>, cancel: CancellationToken) -> Self {
        let monitor_delay = Duration::from_millis(task.monitor_delay_ms);
        let error_delay = Duration::from_millis(task.error_delay_ms);
        Self {
            ids: vec![id.clone()],
            id,
            task,
            proxy: None,
            last_proxy: None,
            session: None,
            cancel,
            harvest_state: HarvestState::Idle,
            captcha_request: None,
            captcha_queue: None,
            captcha_token: None,
            stale_tokens: false,
            monitor_delay,
            error_delay,
            monitor_failures: 0,
            checkout_failures: 0,
            product: None,
            message: None,
        }
    }

    // Identity

    /// Primary run id.
    pub fn id(&self) -> &RunId {
        &self.id
    }

    /// Every id this run answers to, primary first.
    pub fn ids(&self) -> &[RunId] {
        &self.ids
    }

    /// Register an alias for a concurrent session attempt.
    pub fn add_id(&mut self, id: RunId) {
        if !self.has_id(&id) {
            self.ids.push(id);
        }
    }

    pub fn has_id(&self, id: &RunId) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    /// Drop an id. The last remaining id is never removed.
    pub fn remove_id(&mut self, id: &RunId) -> bool {
        if self.ids.len() <= 1 || !self.has_id(id) {
            return false;
        }
        self.ids.retain(|i| i != id);
        if &self.id == id {
            self.id = self.ids[0].clone();
        }
        true
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    // Proxy and session

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn last_proxy(&self) -> Option<&Proxy> {
        self.last_proxy.as_ref()
    }

    /// Make `proxy` the active proxy, remembering the previous one.
    pub fn swap_proxy(&mut self, proxy: Option<Proxy>) {
        self.last_proxy = std::mem::replace(&mut self.proxy, proxy);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    // Cancellation

    /// Returns true once stop or abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed at every suspension point of this run.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the run aborted and cancel any outstanding token wait.
    ///
    /// Returns true only for the call that set the flag.
    pub fn abort(&mut self) -> bool {
        let first = !self.cancel.is_cancelled();
        self.cancel.cancel();
        if let Some(request) = self.captcha_request.take() {
            request.cancel(ABORTED_REASON);
            self.harvest_state = HarvestState::Idle;
        }
        first
    }

    // Challenge harvesting

    pub fn harvest_state(&self) -> HarvestState {
        self.harvest_state
    }

    pub fn captcha_token(&self) -> Option<&str> {
        self.captcha_token.as_deref()
    }

    pub fn captcha_request(&self) -> Option<&HandoffRequest<String>> {
        self.captcha_request.as_ref()
    }

    pub fn captcha_queue(&self) -> Option<&AsyncHandoffQueue<String>> {
        self.captcha_queue.as_ref()
    }

    /// Register a waiter on `queue` and move to `Requesting`.
    ///
    /// Any unconsumed token is discarded. After a wait that ended without a
    /// token, tokens queued since then answer the abandoned challenge and are
    /// dropped too; a backlog built up before the first request is kept.
    pub fn request_token(&mut self, queue: &AsyncHandoffQueue<String>) -> HandoffRequest<String> {
        if std::mem::take(&mut self.stale_tokens) {
            queue.clear();
        }
        let request = queue.next();
        self.captcha_queue = Some(queue.clone());
        self.captcha_request = Some(request.clone());
        self.captcha_token = None;
        self.harvest_state = HarvestState::Requesting;
        request
    }

    /// Store a delivered token and move to `Fulfilled`.
    pub fn fulfil_token(&mut self, token: String) {
        self.captcha_request = None;
        self.captcha_token = Some(token);
        self.harvest_state = HarvestState::Fulfilled;
    }

    /// Consume the token (tokens are single use) and return to `Idle`.
    pub fn take_token(&mut self) -> Option<String> {
        let token = self.captcha_token.take();
        if self.harvest_state == HarvestState::Fulfilled {
            self.harvest_state = HarvestState::Idle;
        }
        token
    }

    /// Abandon harvesting: cancel a pending wait with `reason`, drop any token
    /// and the queue reference.
    ///
    /// If a request was outstanding, its queue's backlog is cleared and the
    /// next `request_token` ignores tokens that arrive in between.
    pub fn end_harvest(&mut self, reason: &str) {
        if let Some(request) = self.captcha_request.take() {
            request.cancel(reason);
            if let Some(queue) = &self.captcha_queue {
                queue.clear();
            }
            self.stale_tokens = true;
        }
        self.captcha_queue = None;
        self.captcha_token = None;
        self.harvest_state = HarvestState::Idle;
    }

    // Delays and retry accounting

    pub fn monitor_delay(&self) -> Duration {
        self.monitor_delay
    }

    pub fn error_delay(&self) -> Duration {
        self.error_delay
    }

    pub fn set_delays(&mut self, monitor_delay: Duration, error_delay: Duration) {
        self.monitor_delay = monitor_delay;
        self.error_delay = error_delay;
    }

    /// Count a transient monitor failure, returning the running count.
    pub fn note_monitor_failure(&mut self) -> u32 {
        self.monitor_failures += 1;
        self.monitor_failures
    }

    pub fn reset_monitor_failures(&mut self) {
        self.monitor_failures = 0;
    }

    /// Count a recoverable checkout failure, returning the running count.
    pub fn note_checkout_failure(&mut self) -> u32 {
        self.checkout_failures += 1;
        self.checkout_failures
    }

    pub fn reset_checkout_failures(&mut self) {
        self.checkout_failures = 0;
    }

    // Product and status message

    pub fn product(&self) -> Option<&ProductInfo> {
        self.product.as_ref()
    }

    pub fn set_product(&mut self, product: ProductInfo) {
        self.product = Some(product);
    }

    /// Record `message` as the latest status; false if it repeats the last one.
    pub fn note_message(&mut self, message: &str) -> bool {
        if self.message.as_deref() == Some(message) {
            return false;
        }
        self.message = Some(message.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droprun_core::{ProductSelector, RequestStatus, SiteDescriptor};

    fn context() -> RunContext {
        let task = Task::new(
            "simulated",
            SiteDescriptor {
                name: "Test".to_string(),
                url: "https://shop.test".to_string(),
                site_key: None,
            },
            ProductSelector::Variant {
                id: "123".to_string(),
            },
            "profile",
        )
        .with_delays(100, 200);
        RunContext::new(RunId::new("run-1"), Arc::new(task), CancellationToken::new())
    }

    #[test]
    fn test_copies_delays_from_task() {
        let ctx = context();
        assert_eq!(ctx.monitor_delay(), Duration::from_millis(100));
        assert_eq!(ctx.error_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_ids_never_empty() {
        let mut ctx = context();
        let primary = ctx.id().clone();
        assert!(!ctx.remove_id(&primary));

        ctx.add_id(RunId::new("run-2"));
        ctx.add_id(RunId::new("run-2"));
        assert_eq!(ctx.ids().len(), 2);
        assert!(ctx.has_id(&RunId::new("run-2")));

        assert!(ctx.remove_id(&primary));
        assert_eq!(ctx.id(), &RunId::new("run-2"));
        assert!(!ctx.remove_id(&RunId::new("run-2")));
    }

    #[test]
    fn test_swap_proxy_remembers_last() {
        let mut ctx = context();
        let a = Proxy::parse("10.0.0.1:80").unwrap();
        let b = Proxy::parse("10.0.0.2:80").unwrap();

        ctx.swap_proxy(a.clone());
        ctx.swap_proxy(b.clone());
        assert_eq!(ctx.proxy(), b.as_ref());
        assert_eq!(ctx.last_proxy(), a.as_ref());
    }

    #[test]
    fn test_token_set_iff_fulfilled() {
        let mut ctx = context();
        let queue = AsyncHandoffQueue::new();
        assert_eq!(ctx.harvest_state(), HarvestState::Idle);

        let request = ctx.request_token(&queue);
        assert_eq!(ctx.harvest_state(), HarvestState::Requesting);
        assert!(ctx.captcha_token().is_none());

        queue.insert("tok".to_string());
        ctx.fulfil_token(request.value().unwrap());
        assert_eq!(ctx.harvest_state(), HarvestState::Fulfilled);
        assert_eq!(ctx.captcha_token(), Some("tok"));

        assert_eq!(ctx.take_token().as_deref(), Some("tok"));
        assert_eq!(ctx.harvest_state(), HarvestState::Idle);
        assert!(ctx.captcha_token().is_none());
    }

    #[test]
    fn test_abort_is_set_once_and_cancels_wait() {
        let mut ctx = context();
        let queue = AsyncHandoffQueue::new();
        let request = ctx.request_token(&queue);

        assert!(ctx.abort());
        assert!(!ctx.abort());
        assert!(ctx.is_aborted());
        assert_eq!(request.status(), RequestStatus::Cancelled);
        assert_eq!(request.reason().as_deref(), Some(ABORTED_REASON));
        assert_eq!(queue.waiting_len(), 0);
    }

    #[test]
    fn test_end_harvest_resets() {
        let mut ctx = context();
        let queue = AsyncHandoffQueue::new();
        let request = ctx.request_token(&queue);
        ctx.end_harvest("timeout");

        assert_eq!(request.reason().as_deref(), Some("timeout"));
        assert!(ctx.captcha_queue().is_none());
        assert_eq!(ctx.harvest_state(), HarvestState::Idle);
    }

    #[test]
    fn test_tokens_after_abandoned_wait_are_dropped() {
        let mut ctx = context();
        let queue = AsyncHandoffQueue::new();
        queue.insert("early".to_string());
        let first = ctx.request_token(&queue);
        assert_eq!(first.value().as_deref(), Some("early"));
        ctx.fulfil_token("early".to_string());
        ctx.take_token();

        let second = ctx.request_token(&queue);
        assert!(second.is_pending());
        ctx.end_harvest("timeout");
        queue.insert("late".to_string());
        assert_eq!(queue.backlog_len(), 1);

        let third = ctx.request_token(&queue);
        assert!(third.is_pending());
        assert_eq!(queue.backlog_len(), 0);
        queue.insert("fresh".to_string());
        assert_eq!(third.value().as_deref(), Some("fresh"));
    }

    #[test]
    fn test_message_dedup() {
        let mut ctx = context();
        assert!(ctx.note_message("Monitoring"));
        assert!(!ctx.note_message("Monitoring"));
        assert!(ctx.note_message("Checking out"));
    }
}
