use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use runway_api::{ServiceClient, ServiceRegistry};
use runway_engine::config::{RunwayConfig, load_config, load_config_from_path};
use runway_engine::{
    Collaborators, Engine, FileWorkflowRepository, HttpJobService, HttpProvisioner, InMemoryStateStore, JobServices, LocalQueue, LogMailer,
    Orchestrator, SystemClock, parse_workflow_file,
};
use runway_types::{ExecutionRun, RunHandle, StepOptions, WorkflowId};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Trigger and follow multi-step data workflows.
#[derive(Parser, Debug)]
#[command(name = "runway", version, about)]
struct Cli {
    /// Configuration file; defaults to `RUNWAY_CONFIG_PATH` or the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a workflow definition file
    Validate {
        /// Path to a workflow YAML/JSON file
        file: PathBuf,
    },
    /// Run a stored workflow and wait for it to finish
    Run {
        workflow_id: i64,

        /// Run parameter merged into every step's options; repeatable
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Print the final run record as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { file } => validate(file),
        Command::Run { workflow_id, params, json } => {
            let config = match &cli.config {
                Some(path) => load_config_from_path(path)?,
                None => load_config()?,
            };
            run(&config, WorkflowId(workflow_id), params.into_iter().collect(), json).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

/// `key=value`; the value is taken as JSON when it parses, else as a string.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("parameter name is empty in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn validate(file: PathBuf) -> Result<()> {
    let workflow = parse_workflow_file(&file)?;
    println!(
        "{}: workflow {} '{}' is valid ({} steps on cluster '{}')",
        file.display(),
        workflow.id,
        workflow.title,
        workflow.steps.len(),
        workflow.cluster.name()
    );
    Ok(())
}

fn build_engine(config: &RunwayConfig) -> Result<(Engine, Arc<LocalQueue>)> {
    let registry = ServiceRegistry::new();
    registry
        .refresh(config.services.resolved_locations())
        .context("invalid service location")?;
    let client = ServiceClient::new(Arc::new(registry), config.engine.request_timeout())?;

    let repository = Arc::new(FileWorkflowRepository::new(config.storage.workflows_dir()));
    let collaborators = Collaborators {
        repository: repository.clone(),
        users: repository,
        provisioner: Arc::new(HttpProvisioner::new(client.clone())),
        jobs: JobServices::new(
            Arc::new(HttpJobService::sql(client.clone())),
            Arc::new(HttpJobService::code_jobs(client.clone())),
            Arc::new(HttpJobService::data_jobs(client)),
        ),
        mailer: Arc::new(LogMailer),
    };

    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStateStore::new(clock.clone()));
    let queue = Arc::new(LocalQueue::new(config.engine.max_redeliveries, config.engine.redelivery_delay()));
    let engine = Engine::new(&collaborators, store, queue.clone(), clock, &config.engine);
    Ok((engine, queue))
}

async fn run(config: &RunwayConfig, workflow_id: WorkflowId, parameters: StepOptions, json: bool) -> Result<()> {
    let (engine, queue) = build_engine(config)?;
    let workers = queue.spawn_workers(config.engine.workers, engine.sequencer());

    let orchestrator = engine.orchestrator();
    let handle = orchestrator
        .trigger_with(workflow_id, parameters)
        .await
        .with_context(|| format!("failed to trigger workflow {workflow_id}"))?;
    info!(%handle, workflow = %workflow_id, "run triggered");

    let run = follow(orchestrator, &handle, !json).await?;
    for worker in workers {
        worker.abort();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    }
    match run.error {
        Some(error) => bail!("workflow {workflow_id} failed: {error}"),
        None => Ok(()),
    }
}

/// Polls the run until it finishes, echoing status changes. The first
/// Ctrl-C requests cancellation; the run still has to reach its terminal
/// state, which includes tearing down a booted cluster.
async fn follow(orchestrator: &Orchestrator, handle: &RunHandle, print: bool) -> Result<ExecutionRun> {
    let mut last_line = String::new();
    let mut cancel_requested = false;
    let mut ticker = tokio::time::interval(FOLLOW_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                signal.context("failed to listen for Ctrl-C")?;
                warn!(%handle, "cancelling run");
                orchestrator.cancel(handle).await?;
                cancel_requested = true;
            }
        }

        let run = orchestrator.run_status(handle).await?;
        let line = status_line(&run);
        if print && line != last_line {
            println!("{line}");
            last_line = line;
        }
        if run.finished {
            return Ok(run);
        }
    }
}

fn status_line(run: &ExecutionRun) -> String {
    format!("[{}/{}] {}", run.steps_complete, run.total_steps, run.message)
}
