//! Supervisor for a collection of task runners.
//!
//! The manager owns the configured tasks, spawns one [`TaskRunner`] per run,
//! fans commands out to them, and fans their events in: checkout summaries
//! go to the notification sinks and terminal outcomes go to the task store.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use droprun_core::{CoreError, Proxy, RunId, StatusEvent, Task, TaskId, TaskRecord, TaskState};
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::driver::DriverRegistry;
use crate::notify::NotificationSink;
use crate::runner::{RunOutcome, RunnerHandle, TaskRunner};
use crate::store::{MemoryStore, StoreError, TaskStore};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("No site driver for platform '{0}' (field: platform)")]
    NoDriver(String),

    #[error("Invalid task: {0}")]
    InvalidTask(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Runner for task {0} exited without an outcome")]
    RunnerGone(TaskId),
}

/// A run spawned by the manager.
struct ManagedRun {
    handle: RunnerHandle,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

struct ManagedTask {
    task: Arc<Task>,
    run: Option<ManagedRun>,
}

impl ManagedTask {
    fn active_run(&self) -> Option<&ManagedRun> {
        self.run
            .as_ref()
            .filter(|run| run.outcome.borrow().is_none())
    }
}

/// Supervises task runners.
pub struct TaskManager {
    registry: DriverRegistry,
    config: Arc<RunnerConfig>,
    tasks: RwLock<HashMap<TaskId, ManagedTask>>,
    events: broadcast::Sender<StatusEvent>,
    store: Arc<dyn TaskStore>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    fan_in: OnceLock<JoinHandle<()>>,
}

impl TaskManager {
    /// Create a manager backed by an in-memory store.
    pub fn new(registry: DriverRegistry, config: RunnerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            registry,
            config: Arc::new(config),
            tasks: RwLock::new(HashMap::new()),
            events,
            store: Arc::new(MemoryStore::new()),
            sinks: Vec::new(),
            fan_in: OnceLock::new(),
        }
    }

    /// Builder method to persist records in `store`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = store;
        self
    }

    /// Builder method to add a notification sink.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Subscribe to status events from every runner.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Register a task. Its platform must have a driver.
    pub async fn add_task(&self, task: Task) -> Result<TaskId, ManagerError> {
        let record = TaskRecord::new(task.clone());
        self.insert_task(task, record).await
    }

    /// Re-register a task from its stored record.
    pub async fn restore(&self, task_id: &TaskId) -> Result<TaskId, ManagerError> {
        let record = self
            .store
            .get(task_id)?
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;
        info!(task_id = %task_id, last_state = %record.last_state, "Restoring task");
        self.insert_task(record.task.clone(), record).await
    }

    async fn insert_task(&self, task: Task, record: TaskRecord) -> Result<TaskId, ManagerError> {
        if self.registry.get(&task.platform).is_none() {
            return Err(ManagerError::NoDriver(task.platform));
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(ManagerError::DuplicateTask(task.id));
        }

        self.store.put(&task.id, &record)?;
        let task_id = task.id.clone();
        info!(task_id = %task_id, platform = %task.platform, "Task added");
        tasks.insert(
            task_id.clone(),
            ManagedTask {
                task: Arc::new(task),
                run: None,
            },
        );
        Ok(task_id)
    }

    /// Remove a task, stopping its run and deleting its record.
    ///
    /// An active run is stopped and awaited first, so its outcome cannot
    /// land after the record is gone.
    pub async fn remove_task(&self, task_id: &TaskId) -> Result<(), ManagerError> {
        let removed = self
            .tasks
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;
        if let Some(run) = removed.active_run() {
            run.handle.stop();
            let mut outcome = run.outcome.clone();
            // A dropped sender means the runner is gone; nothing left to wait on.
            let _ = outcome.wait_for(Option::is_some).await;
        }
        self.store.remove(task_id)?;
        info!(task_id = %task_id, "Task removed");
        Ok(())
    }

    /// Start a run of `task_id`. Starting a task that is already running
    /// returns the current run id.
    pub async fn start(&self, task_id: &TaskId) -> Result<RunId, ManagerError> {
        self.ensure_fan_in();

        let mut tasks = self.tasks.write().await;
        let managed = tasks
            .get_mut(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;

        if let Some(run) = managed.active_run() {
            debug!(task_id = %task_id, run_id = %run.handle.run_id(), "Task already running");
            return Ok(run.handle.run_id().clone());
        }

        let driver = self
            .registry
            .get(&managed.task.platform)
            .ok_or_else(|| ManagerError::NoDriver(managed.task.platform.clone()))?;

        let (runner, handle) = TaskRunner::new(
            Arc::clone(&managed.task),
            driver,
            Arc::clone(&self.config),
            self.events.clone(),
        );
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let store = Arc::clone(&self.store);
        let task = Arc::clone(&managed.task);

        tokio::spawn(async move {
            let outcome = runner.run().await;
            persist_outcome(store.as_ref(), &task, &outcome);
            outcome_tx.send_replace(Some(outcome));
        });

        if !handle.start() {
            return Err(ManagerError::RunnerGone(task_id.clone()));
        }

        let run_id = handle.run_id().clone();
        info!(task_id = %task_id, run_id = %run_id, "Task started");
        managed.run = Some(ManagedRun {
            handle,
            outcome: outcome_rx,
        });
        Ok(run_id)
    }

    /// Start every registered task. Failures are logged and skipped.
    pub async fn start_all(&self) -> Vec<RunId> {
        let mut started = Vec::new();
        for task_id in self.task_ids().await {
            match self.start(&task_id).await {
                Ok(run_id) => started.push(run_id),
                Err(e) => error!(task_id = %task_id, error = %e, "Failed to start task"),
            }
        }
        started
    }

    pub async fn stop(&self, task_id: &TaskId) -> Result<(), ManagerError> {
        self.with_active(task_id, |handle| handle.stop()).await
    }

    pub async fn abort(&self, task_id: &TaskId) -> Result<(), ManagerError> {
        self.with_active(task_id, |handle| handle.abort()).await
    }

    pub async fn stop_all(&self) {
        let tasks = self.tasks.read().await;
        for managed in tasks.values() {
            if let Some(run) = managed.active_run() {
                run.handle.stop();
            }
        }
        info!(count = tasks.len(), "Stop requested for all tasks");
    }

    /// Replace the proxy list of a task. Applies to the current run at its
    /// next step and to every later run.
    pub async fn update_proxies(
        &self,
        task_id: &TaskId,
        proxies: Vec<String>,
    ) -> Result<(), ManagerError> {
        let mut tasks = self.tasks.write().await;
        let managed = tasks
            .get_mut(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;

        let mut task = (*managed.task).clone();
        task.proxies = proxies;
        let parsed: Vec<Proxy> = task.parsed_proxies()?;

        if let Some(run) = managed.active_run() {
            run.handle.update_proxies(parsed);
        }
        self.store.put(task_id, &self.record_for(&task)?)?;
        managed.task = Arc::new(task);
        Ok(())
    }

    /// Change the delays of a task. Applies like [`update_proxies`](Self::update_proxies).
    pub async fn update_delays(
        &self,
        task_id: &TaskId,
        monitor_delay_ms: u64,
        error_delay_ms: u64,
    ) -> Result<(), ManagerError> {
        let mut tasks = self.tasks.write().await;
        let managed = tasks
            .get_mut(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;

        let task = (*managed.task).clone().with_delays(monitor_delay_ms, error_delay_ms);
        if let Some(run) = managed.active_run() {
            run.handle.update_delays(monitor_delay_ms, error_delay_ms);
        }
        self.store.put(task_id, &self.record_for(&task)?)?;
        managed.task = Arc::new(task);
        Ok(())
    }

    /// Forward a harvested token to the run it was requested for.
    ///
    /// Returns false when `request_id` is not the task's current run.
    pub async fn harvest_token(
        &self,
        task_id: &TaskId,
        request_id: &RunId,
        token: impl Into<String>,
    ) -> Result<bool, ManagerError> {
        let tasks = self.tasks.read().await;
        let managed = tasks
            .get(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;
        let delivered = managed
            .active_run()
            .map(|run| run.handle.harvest_token(request_id, token))
            .unwrap_or(false);
        if !delivered {
            warn!(task_id = %task_id, request_id = %request_id, "Dropping token for inactive run");
        }
        Ok(delivered)
    }

    /// Current state of the task's latest run, `None` if it never ran.
    pub async fn state(&self, task_id: &TaskId) -> Result<Option<TaskState>, ManagerError> {
        let tasks = self.tasks.read().await;
        let managed = tasks
            .get(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;
        Ok(managed.run.as_ref().map(|run| run.handle.state()))
    }

    /// Snapshot of every task and the state of its latest run.
    pub async fn states(&self) -> Vec<(TaskId, Option<TaskState>)> {
        let tasks = self.tasks.read().await;
        let mut states: Vec<_> = tasks
            .iter()
            .map(|(id, managed)| (id.clone(), managed.run.as_ref().map(|r| r.handle.state())))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub async fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stored record for a task.
    pub fn record(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, ManagerError> {
        Ok(self.store.get(task_id)?)
    }

    /// Wait for the task's latest run to finish and return its outcome.
    pub async fn wait(&self, task_id: &TaskId) -> Result<RunOutcome, ManagerError> {
        let mut outcome = {
            let tasks = self.tasks.read().await;
            let managed = tasks
                .get(task_id)
                .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;
            match &managed.run {
                Some(run) => run.outcome.clone(),
                None => return Err(ManagerError::TaskNotFound(task_id.clone())),
            }
        };

        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map(|o| o.clone())
            .map_err(|_| ManagerError::RunnerGone(task_id.clone()))?;
        finished.ok_or_else(|| ManagerError::RunnerGone(task_id.clone()))
    }

    /// Wait for every started run to finish.
    pub async fn wait_all(&self) -> Vec<RunOutcome> {
        let mut outcomes = Vec::new();
        for task_id in self.task_ids().await {
            let started = matches!(self.state(&task_id).await, Ok(Some(_)));
            if !started {
                continue;
            }
            match self.wait(&task_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(task_id = %task_id, error = %e, "Lost track of run"),
            }
        }
        outcomes
    }

    async fn with_active(
        &self,
        task_id: &TaskId,
        f: impl FnOnce(&RunnerHandle),
    ) -> Result<(), ManagerError> {
        let tasks = self.tasks.read().await;
        let managed = tasks
            .get(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.clone()))?;
        if let Some(run) = managed.active_run() {
            f(&run.handle);
        }
        Ok(())
    }

    fn record_for(&self, task: &Task) -> Result<TaskRecord, ManagerError> {
        let mut record = self
            .store
            .get(&task.id)?
            .unwrap_or_else(|| TaskRecord::new(task.clone()));
        record.task = task.clone();
        Ok(record)
    }

    fn ensure_fan_in(&self) {
        self.fan_in.get_or_init(|| {
            let events = self.events.subscribe();
            let sinks = self.sinks.clone();
            tokio::spawn(fan_in(events, sinks))
        });
    }
}

/// Forward checkout summaries to every sink.
async fn fan_in(
    mut events: broadcast::Receiver<StatusEvent>,
    sinks: Vec<Arc<dyn NotificationSink>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notification fan-in lagged behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(summary) = event.summary.as_ref() else {
            continue;
        };
        for sink in &sinks {
            debug!(sink = sink.name(), task_id = %event.task_id, "Sending checkout notification");
            sink.notify(&event.task_id, summary).await;
        }
    }
}

/// Fold a run's outcome into the task's record. A missing record means the
/// task was removed, and it stays removed.
fn persist_outcome(store: &dyn TaskStore, task: &Task, outcome: &RunOutcome) {
    let result = store.get(&task.id).and_then(|record| {
        let Some(mut record) = record else {
            debug!(task_id = %task.id, "Task record gone, outcome not persisted");
            return Ok(());
        };
        record.update(outcome.state, outcome.reason.clone());
        if outcome.order.is_some() {
            record.order = outcome.order.clone();
        }
        store.put(&task.id, &record)
    });

    if let Err(e) = result {
        error!(task_id = %task.id, error = %e, "Failed to persist task outcome");
    }
}
