//! Per-task execution engine.
//!
//! A [`TaskRunner`] drives one run of a task through
//! `Initialized -> Started -> TaskSetup -> Monitor/Restock -> Checkout` and
//! into a terminal state, calling the site driver at each step. The matching
//! [`RunnerHandle`] is how the supervisor starts, stops, reconfigures, and
//! feeds challenge tokens to a runner that may be suspended.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use droprun_core::{
    CheckoutSummary, HistoryBuffer, OrderInfo, Proxy, RunId, StatusEvent, Task, TaskId, TaskState,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::context::{RunContext, ABORTED_REASON};
use crate::driver::{Challenge, DriverError, SiteDriver};
use crate::handoff::{AsyncHandoffQueue, HandoffError};
use crate::proxy::ProxyPool;
use crate::session::Session;

/// Reason the runner cancels its own token wait with at the checkout timeout.
const TIMEOUT_REASON: &str = "timeout";

/// Commands a runner picks up between steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Leave `Initialized` and begin the run.
    Start,
    /// Replace the task's proxy pool.
    UpdateProxies(Vec<Proxy>),
    /// Change the poll and error cadence.
    UpdateDelays {
        monitor_delay_ms: u64,
        error_delay_ms: u64,
    },
}

/// How a run was cancelled from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Explicit stop command; the run ends `Stopped`.
    Stop,
    /// Abort; the run ends `Aborted`.
    Abort,
}

/// Cancellation shared between a runner and its handle. The first stop kind
/// recorded wins.
#[derive(Debug, Default)]
struct Control {
    cancel: CancellationToken,
    kind: OnceLock<StopKind>,
}

impl Control {
    fn request(&self, kind: StopKind) {
        let _ = self.kind.set(kind);
        self.cancel.cancel();
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub state: TaskState,
    pub reason: Option<String>,
    pub order: Option<OrderInfo>,
}

/// Supervisor-side handle to a runner.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    task_id: TaskId,
    run_id: RunId,
    commands: mpsc::UnboundedSender<RunnerCommand>,
    control: Arc<Control>,
    captcha_queue: AsyncHandoffQueue<String>,
    state: watch::Receiver<TaskState>,
}

impl RunnerHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Current state of the runner.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Send the start command. Returns false if the runner is gone.
    pub fn start(&self) -> bool {
        self.send(RunnerCommand::Start)
    }

    /// Stop the run. It ends `Stopped` at its next suspension point.
    pub fn stop(&self) {
        self.control.request(StopKind::Stop);
    }

    /// Abort the run. It ends `Aborted` at its next suspension point.
    pub fn abort(&self) {
        self.control.request(StopKind::Abort);
    }

    pub fn update_proxies(&self, proxies: Vec<Proxy>) -> bool {
        self.send(RunnerCommand::UpdateProxies(proxies))
    }

    pub fn update_delays(&self, monitor_delay_ms: u64, error_delay_ms: u64) -> bool {
        self.send(RunnerCommand::UpdateDelays {
            monitor_delay_ms,
            error_delay_ms,
        })
    }

    /// Deliver a harvested challenge token for run `request_id`.
    ///
    /// Only the primary run id routes tokens; aliases registered on the
    /// run's context are not consulted. Returns false for any other id.
    pub fn harvest_token(&self, request_id: &RunId, token: impl Into<String>) -> bool {
        if request_id != &self.run_id {
            return false;
        }
        let backlog = self.captcha_queue.insert(token.into());
        debug!(run_id = %self.run_id, backlog, "Harvested token delivered");
        true
    }

    /// Queue the harvester feeds tokens into for this runner.
    pub fn captcha_queue(&self) -> &AsyncHandoffQueue<String> {
        &self.captcha_queue
    }

    /// Wait until the runner reaches a terminal state.
    pub async fn wait_terminal(&self) -> TaskState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }

    fn send(&self, command: RunnerCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Outcome of one state handler.
#[derive(Debug)]
struct Step {
    next: TaskState,
    reason: Option<String>,
}

impl Step {
    fn to(next: TaskState) -> Self {
        Self { next, reason: None }
    }

    fn because(next: TaskState, reason: impl Into<String>) -> Self {
        Self {
            next,
            reason: Some(reason.into()),
        }
    }
}

/// How a challenge token wait ended.
enum TokenWait {
    Delivered,
    Cancelled,
    TimedOut,
    Lost(HandoffError),
}

/// What the token wait select observed, before any bookkeeping.
enum Waited {
    Token(String),
    Cancelled,
    TimedOut,
    Failed(HandoffError),
}

/// Run `future` unless `cancel` fires first.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

/// State machine for one run of one task.
pub struct TaskRunner {
    task: Arc<Task>,
    driver: Arc<dyn SiteDriver>,
    config: Arc<RunnerConfig>,
    ctx: RunContext,
    state: TaskState,
    resume: TaskState,
    pool: ProxyPool,
    banned: HistoryBuffer<String>,
    events: broadcast::Sender<StatusEvent>,
    commands: mpsc::UnboundedReceiver<RunnerCommand>,
    control: Arc<Control>,
    captcha_queue: AsyncHandoffQueue<String>,
    state_tx: watch::Sender<TaskState>,
    reason: Option<String>,
    order: Option<OrderInfo>,
}

impl TaskRunner {
    /// Create a runner in `Initialized` and the handle that controls it.
    pub fn new(
        task: Arc<Task>,
        driver: Arc<dyn SiteDriver>,
        config: Arc<RunnerConfig>,
        events: broadcast::Sender<StatusEvent>,
    ) -> (Self, RunnerHandle) {
        let run_id = RunId::generate();
        let control = Arc::new(Control::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TaskState::Initialized);
        let captcha_queue = AsyncHandoffQueue::new();

        // Bad proxy strings are reported by validation in `Started`.
        let pool = ProxyPool::new(task.parsed_proxies().unwrap_or_default());
        let ctx = RunContext::new(run_id.clone(), Arc::clone(&task), control.cancel.clone());

        let handle = RunnerHandle {
            task_id: task.id.clone(),
            run_id,
            commands: commands_tx,
            control: Arc::clone(&control),
            captcha_queue: captcha_queue.clone(),
            state: state_rx,
        };

        let runner = Self {
            banned: HistoryBuffer::new(config.banned_history_capacity),
            task,
            driver,
            config,
            ctx,
            state: TaskState::Initialized,
            resume: TaskState::Monitor,
            pool,
            events,
            commands: commands_rx,
            control,
            captcha_queue,
            state_tx,
            reason: None,
            order: None,
        };

        (runner, handle)
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Drive the run to a terminal state.
    pub async fn run(mut self) -> RunOutcome {
        info!(
            task_id = %self.task.id,
            run_id = %self.ctx.id(),
            platform = %self.task.platform,
            "Runner waiting for start"
        );

        if self.await_start().await {
            self.transition(Step::to(TaskState::Started));
        }

        while self.state.is_active() {
            self.apply_pending_commands();

            if self.ctx.is_aborted() {
                self.ctx.abort();
                let step = self.cancelled_step();
                self.transition(step);
                break;
            }

            let step = match self.state {
                TaskState::Started => self.handle_started(),
                TaskState::TaskSetup => self.handle_setup(),
                TaskState::Monitor | TaskState::Restock => self.handle_monitor().await,
                TaskState::SwapProxies => self.handle_swap(),
                TaskState::Checkout => self.handle_checkout().await,
                TaskState::Initialized
                | TaskState::Finished
                | TaskState::Errored
                | TaskState::Aborted
                | TaskState::Stopped => break,
            };
            self.transition(step);
        }

        self.finish()
    }

    /// Wait in `Initialized` for the start command.
    async fn await_start(&mut self) -> bool {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => None,
                command = self.commands.recv() => Some(command),
            };

            match command {
                None => {
                    let step = self.cancelled_step();
                    self.transition(step);
                    return false;
                }
                Some(Some(RunnerCommand::Start)) => return true,
                Some(Some(other)) => self.apply_command(other),
                Some(None) => {
                    self.transition(Step::because(TaskState::Stopped, "runner handle dropped"));
                    return false;
                }
            }
        }
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: RunnerCommand) {
        match command {
            RunnerCommand::Start => {
                debug!(task_id = %self.task.id, "Ignoring start: runner already started");
            }
            RunnerCommand::UpdateProxies(proxies) => {
                info!(task_id = %self.task.id, count = proxies.len(), "Proxy pool updated");
                self.pool.replace(proxies);
            }
            RunnerCommand::UpdateDelays {
                monitor_delay_ms,
                error_delay_ms,
            } => {
                info!(
                    task_id = %self.task.id,
                    monitor_delay_ms,
                    error_delay_ms,
                    "Delays updated"
                );
                self.ctx.set_delays(
                    Duration::from_millis(monitor_delay_ms),
                    Duration::from_millis(error_delay_ms),
                );
            }
        }
    }

    fn cancelled_step(&self) -> Step {
        match self.control.kind.get() {
            Some(StopKind::Abort) => Step::because(TaskState::Aborted, ABORTED_REASON),
            _ => Step::because(TaskState::Stopped, "stopped"),
        }
    }

    fn transition(&mut self, step: Step) {
        if step.next == self.state {
            return;
        }

        let previous = self.state;
        self.state = step.next;
        if step.next == TaskState::SwapProxies {
            self.resume = if previous == TaskState::Restock {
                TaskState::Restock
            } else {
                TaskState::Monitor
            };
        }

        match (step.next, step.reason.as_deref()) {
            (TaskState::Errored, reason) => error!(
                task_id = %self.task.id,
                run_id = %self.ctx.id(),
                from = %previous,
                reason = ?reason,
                "Task errored"
            ),
            (TaskState::SwapProxies, reason) => warn!(
                task_id = %self.task.id,
                run_id = %self.ctx.id(),
                from = %previous,
                reason = ?reason,
                "Swapping proxies"
            ),
            (next, reason) => info!(
                task_id = %self.task.id,
                run_id = %self.ctx.id(),
                from = %previous,
                to = %next,
                reason = ?reason,
                "State transition"
            ),
        }

        if step.next.is_terminal() {
            self.reason = step.reason.clone();
        }

        self.state_tx.send_replace(step.next);
        self.emit(StatusEvent::transition(
            self.task.id.clone(),
            self.ctx.id().clone(),
            previous,
            step.next,
            step.reason,
        ));
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn emit_monitor(&mut self, message: &str) {
        if self.ctx.note_message(message) {
            self.emit(StatusEvent::monitor(
                self.task.id.clone(),
                self.ctx.id().clone(),
                message,
            ));
        }
    }

    fn emit_checkout(&mut self, message: &str, summary: Option<CheckoutSummary>) {
        if self.ctx.note_message(message) || summary.is_some() {
            self.emit(StatusEvent::checkout(
                self.task.id.clone(),
                self.ctx.id().clone(),
                message,
                summary,
            ));
        }
    }

    /// Sleep for `delay` unless cancelled. Returns false when cancelled.
    ///
    /// Commands arriving meanwhile are applied at once. A delay update ends
    /// the sleep early so the new cadence takes effect on the next step.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut open = true;

        loop {
            let command = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv(), if open => command,
            };

            match command {
                Some(command) => {
                    let interrupts = matches!(command, RunnerCommand::UpdateDelays { .. });
                    self.apply_command(command);
                    if interrupts {
                        return true;
                    }
                }
                None => open = false,
            }
        }
    }

    fn handle_started(&mut self) -> Step {
        match self.driver.validate(&self.task) {
            Ok(()) => Step::to(TaskState::TaskSetup),
            Err(DriverError::Config(e)) => Step::because(
                TaskState::Errored,
                format!("invalid task configuration ({}): {e}", e.field()),
            ),
            Err(e) => Step::because(TaskState::Errored, format!("invalid task configuration: {e}")),
        }
    }

    fn handle_setup(&mut self) -> Step {
        let proxy = self.pool.draw(None, &self.banned);
        let session = match Session::new(proxy.as_ref(), self.config.request_timeout()) {
            Ok(session) => session,
            Err(e) => return Step::because(TaskState::Errored, format!("session setup failed: {e}")),
        };

        debug!(
            task_id = %self.task.id,
            proxy = ?proxy.as_ref().map(|p| p.id.as_str()),
            "Session prepared"
        );
        self.ctx.swap_proxy(proxy);
        self.ctx.set_session(session);
        Step::to(TaskState::Monitor)
    }

    /// Shared handler for `Monitor` and `Restock`.
    async fn handle_monitor(&mut self) -> Step {
        let restocking = self.state == TaskState::Restock;
        let cancel = self.control.cancel.clone();

        let Some(result) = until_cancelled(&cancel, self.driver.check_availability(&self.ctx)).await
        else {
            return self.cancelled_step();
        };
        if self.ctx.is_aborted() {
            return self.cancelled_step();
        }

        match result {
            Ok(availability) if availability.banned => {
                self.ctx.reset_monitor_failures();
                Step::because(
                    TaskState::SwapProxies,
                    availability.message.unwrap_or_else(|| "proxy banned".to_string()),
                )
            }
            Ok(availability) if availability.available => {
                self.ctx.reset_monitor_failures();
                if let Some(product) = availability.product {
                    self.ctx.set_product(product);
                }
                self.emit_monitor("Product found");
                Step::to(TaskState::Checkout)
            }
            Ok(availability) => {
                self.ctx.reset_monitor_failures();
                if let Some(message) = availability.message.as_deref() {
                    self.emit_monitor(message);
                }

                if restocking && !availability.restock {
                    return Step::to(TaskState::Monitor);
                }
                if !restocking && availability.restock {
                    return Step::to(TaskState::Restock);
                }
                let delay = self.ctx.monitor_delay();
                if !self.pause(delay).await {
                    return self.cancelled_step();
                }
                Step::to(self.state)
            }
            Err(DriverError::Banned(message)) => {
                self.ctx.reset_monitor_failures();
                Step::because(TaskState::SwapProxies, message)
            }
            Err(DriverError::Transient(message)) => {
                let failures = self.ctx.note_monitor_failure();
                if failures > self.config.max_monitor_retries {
                    return Step::because(
                        TaskState::Errored,
                        format!("monitor failed {failures} times: {message}"),
                    );
                }
                warn!(
                    task_id = %self.task.id,
                    failures,
                    error = %message,
                    "Monitor error, retrying"
                );
                self.emit_monitor(&format!("Monitor error, retrying ({failures})"));
                let delay = self.ctx.error_delay();
                if !self.pause(delay).await {
                    return self.cancelled_step();
                }
                Step::to(self.state)
            }
            Err(e @ DriverError::Fatal(_)) | Err(e @ DriverError::Config(_)) => {
                Step::because(TaskState::Errored, e.to_string())
            }
        }
    }

    fn handle_swap(&mut self) -> Step {
        if let Some(banned) = self.ctx.proxy() {
            self.banned.insert(banned.id.clone());
        }

        let Some(proxy) = self.pool.draw(self.ctx.proxy(), &self.banned) else {
            return Step::because(TaskState::Errored, "proxy pool exhausted");
        };

        let session = match self.ctx.session() {
            Some(session) => session.rebind(Some(&proxy)),
            None => Session::new(Some(&proxy), self.config.request_timeout()),
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => return Step::because(TaskState::Errored, format!("session rebind failed: {e}")),
        };

        info!(task_id = %self.task.id, proxy = %proxy.id, "Using new proxy");
        self.emit_monitor(&format!("Switched to proxy {}", proxy.id));
        self.ctx.swap_proxy(Some(proxy));
        self.ctx.set_session(session);
        Step::to(self.resume)
    }

    async fn handle_checkout(&mut self) -> Step {
        self.emit_checkout("Submitting checkout", None);
        let cancel = self.control.cancel.clone();

        let Some(result) = until_cancelled(&cancel, self.driver.checkout(&self.ctx)).await else {
            return self.cancelled_step();
        };
        // A token is good for one attempt.
        self.ctx.take_token();
        if self.ctx.is_aborted() {
            return self.cancelled_step();
        }

        match result {
            Ok(outcome) if outcome.success => {
                self.ctx.reset_checkout_failures();
                self.order = outcome.order.clone();
                let summary = self.summary(true, outcome.order);
                self.emit_checkout("Checked out", Some(summary));
                Step::to(TaskState::Finished)
            }
            Ok(outcome) => match outcome.challenge {
                Some(challenge) => match self.await_token(&challenge).await {
                    TokenWait::Delivered => Step::to(TaskState::Checkout),
                    TokenWait::Cancelled => self.cancelled_step(),
                    TokenWait::TimedOut => {
                        self.checkout_failure("challenge token timed out".to_string())
                            .await
                    }
                    TokenWait::Lost(e) => {
                        Step::because(TaskState::Errored, format!("challenge request ended: {e}"))
                    }
                },
                None => {
                    let message = outcome
                        .message
                        .unwrap_or_else(|| "checkout failed".to_string());
                    self.checkout_failure(message).await
                }
            },
            Err(DriverError::Banned(message)) => Step::because(TaskState::SwapProxies, message),
            Err(DriverError::Transient(message)) => self.checkout_failure(message).await,
            Err(e @ DriverError::Fatal(_)) | Err(e @ DriverError::Config(_)) => {
                Step::because(TaskState::Errored, e.to_string())
            }
        }
    }

    /// Count a recoverable checkout failure and back off, or give up.
    async fn checkout_failure(&mut self, message: String) -> Step {
        let failures = self.ctx.note_checkout_failure();
        if failures > self.config.max_checkout_retries {
            let summary = self.summary(false, None);
            self.emit_checkout("Checkout failed", Some(summary));
            return Step::because(
                TaskState::Errored,
                format!("checkout failed after {failures} attempts: {message}"),
            );
        }

        warn!(
            task_id = %self.task.id,
            failures,
            error = %message,
            "Checkout attempt failed, retrying"
        );
        self.emit_checkout(&format!("{message}, retrying"), None);
        let delay = self.ctx.error_delay();
        if !self.pause(delay).await {
            return self.cancelled_step();
        }
        Step::to(TaskState::Checkout)
    }

    /// Register a waiter on the captcha queue and suspend until a token
    /// arrives, the run is cancelled, or the checkout timeout elapses.
    async fn await_token(&mut self, challenge: &Challenge) -> TokenWait {
        let request = self.ctx.request_token(&self.captcha_queue);
        info!(
            task_id = %self.task.id,
            run_id = %self.ctx.id(),
            channel = %challenge.channel,
            "Waiting for challenge token"
        );
        self.emit(StatusEvent::harvest_started(
            self.task.id.clone(),
            self.ctx.id().clone(),
            &challenge.site_key,
            &challenge.channel,
        ));
        self.emit_checkout("Waiting for captcha", None);

        let cancel = self.control.cancel.clone();
        let timeout = self.config.checkout_timeout();
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            result = request.wait() => match result {
                Ok(token) => Waited::Token(token),
                Err(e) => Waited::Failed(e),
            },
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
        };

        let outcome = match waited {
            Waited::Token(token) => {
                self.ctx.fulfil_token(token);
                TokenWait::Delivered
            }
            Waited::Cancelled => {
                self.ctx.end_harvest(ABORTED_REASON);
                TokenWait::Cancelled
            }
            Waited::TimedOut => {
                self.ctx.end_harvest(TIMEOUT_REASON);
                TokenWait::TimedOut
            }
            Waited::Failed(e) => {
                self.ctx.end_harvest(ABORTED_REASON);
                TokenWait::Lost(e)
            }
        };

        self.emit(StatusEvent::harvest_stopped(
            self.task.id.clone(),
            self.ctx.id().clone(),
        ));
        outcome
    }

    fn summary(&self, success: bool, order: Option<OrderInfo>) -> CheckoutSummary {
        let product = self.ctx.product();
        CheckoutSummary {
            success,
            product: product
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "Unknown product".to_string()),
            price: product.and_then(|p| p.price.clone()),
            site: self.task.site.name.clone(),
            profile: self.task.profile.clone(),
            size: product
                .and_then(|p| p.size.clone())
                .or_else(|| self.task.sizes.first().cloned()),
            image: product.and_then(|p| p.image.clone()),
            order,
        }
    }

    /// Release harvest resources and report the outcome.
    fn finish(mut self) -> RunOutcome {
        let outstanding = self.ctx.captcha_request().is_some();
        self.ctx.end_harvest(ABORTED_REASON);
        self.driver.release(&self.ctx);
        if outstanding {
            self.emit(StatusEvent::harvest_stopped(
                self.task.id.clone(),
                self.ctx.id().clone(),
            ));
        }

        info!(
            task_id = %self.task.id,
            run_id = %self.ctx.id(),
            state = %self.state,
            "Runner finished"
        );

        RunOutcome {
            task_id: self.task.id.clone(),
            run_id: self.ctx.id().clone(),
            state: self.state,
            reason: self.reason,
            order: self.order,
        }
    }
}
