//! droprun - run checkout tasks from a task file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use droprun_core::{StatusEventType, Task};
use droprun_runner::output::{self, OutputMode};
use droprun_runner::{
    collect_metrics, DriverRegistry, JsonFileStore, RunOutcome, RunnerConfig, SimulatedDriver,
    TaskManager, TracingSink,
};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// droprun - retail checkout task runner
#[derive(Parser)]
#[command(name = "droprun")]
#[command(about = "Run checkout tasks against registered site drivers", long_about = None)]
struct Cli {
    /// JSON file holding a list of tasks
    #[arg(short, long)]
    tasks: PathBuf,

    /// JSON runner configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for task records (kept in memory when omitted)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Maximum log level
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Polls before the simulated product goes live
    #[arg(long, default_value_t = 3)]
    sim_polls: u32,

    /// Make simulated checkouts raise a challenge
    #[arg(long)]
    sim_challenge: bool,

    /// Answer challenges with generated tokens
    #[arg(long)]
    auto_harvest: bool,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only events
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => RunnerConfig::from_file(path)?,
        None => RunnerConfig::default(),
    };
    let tasks = load_tasks(&cli.tasks)?;

    let registry = DriverRegistry::new().with_driver(Arc::new(SimulatedDriver::new(
        cli.sim_polls,
        cli.sim_challenge,
    )));
    let mut manager = TaskManager::new(registry, config).with_sink(Arc::new(TracingSink));
    if let Some(dir) = &cli.store {
        manager = manager.with_store(Arc::new(JsonFileStore::open(dir)?));
    }
    let manager = Arc::new(manager);

    for task in tasks {
        let task_id = task.id.clone();
        if let Err(e) = manager.add_task(task).await {
            error!(task_id = %task_id, error = %e, "Skipping task");
        }
    }

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let printer = tokio::spawn(print_events(BroadcastStream::new(manager.subscribe()), mode));
    let harvester = cli
        .auto_harvest
        .then(|| tokio::spawn(auto_harvest(Arc::clone(&manager))));

    let started = manager.start_all().await;
    info!(count = started.len(), "Tasks started");

    let finished = tokio::select! {
        outcomes = manager.wait_all() => Some(outcomes),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcomes = match finished {
        Some(outcomes) => outcomes,
        None => {
            warn!("Interrupted, stopping all tasks");
            manager.stop_all().await;
            manager.wait_all().await
        }
    };

    report(&outcomes);
    if cli.metrics {
        print!("{}", collect_metrics(&manager).await);
    }

    printer.abort();
    if let Some(harvester) = harvester {
        harvester.abort();
    }
    Ok(())
}

fn load_tasks(path: &Path) -> Result<Vec<Task>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read tasks from '{}': {}", path.display(), e))?;
    let tasks: Vec<Task> = serde_json::from_str(&raw)?;
    info!(path = %path.display(), count = tasks.len(), "Loaded tasks");
    Ok(tasks)
}

async fn print_events(mut events: BroadcastStream<droprun_core::StatusEvent>, mode: OutputMode) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => output::emit(&event, mode),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged behind");
            }
        }
    }
}

/// Stand-in harvester: answers every challenge with a generated token.
async fn auto_harvest(manager: Arc<TaskManager>) {
    let mut events = BroadcastStream::new(manager.subscribe());
    while let Some(event) = events.next().await {
        let Ok(event) = event else {
            continue;
        };
        if event.event_type != StatusEventType::Harvest || event.message.as_deref() != Some("start")
        {
            continue;
        }

        let token = format!("sim-{:08x}", rand::random::<u32>());
        match manager
            .harvest_token(&event.task_id, &event.run_id, token)
            .await
        {
            Ok(true) => info!(task_id = %event.task_id, "Harvested token delivered"),
            Ok(false) => warn!(task_id = %event.task_id, "Harvest request no longer active"),
            Err(e) => error!(task_id = %event.task_id, error = %e, "Harvest failed"),
        }
    }
}

fn report(outcomes: &[RunOutcome]) {
    for outcome in outcomes {
        match &outcome.order {
            Some(order) => info!(
                task_id = %outcome.task_id,
                state = %outcome.state,
                order = %order.number,
                "Run finished"
            ),
            None => info!(
                task_id = %outcome.task_id,
                state = %outcome.state,
                reason = ?outcome.reason,
                "Run finished"
            ),
        }
    }
}
