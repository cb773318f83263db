//! The `cascade` command-line interface.
//!
//! `cascade worker start` runs a long-lived worker process; the
//! `cascade workflow …` subcommands submit and inspect executions.

mod config;

use cascade_connect::{CredentialResolver, FileCredentialStore, ReqwestRequester};
use cascade_core::ExecutionId;
use cascade_durable::{
    ExecutionClient, NatsExecutionStore, Worker, client::ClientError,
};
use cascade_engine::context::Collaborators;
use cascade_engine::definition::WorkflowDefinition;
use cascade_engine::error::SerializedError;
use cascade_engine::item::ExecutionItem;
use cascade_engine::orchestrator::ExecutionVerdict;
use cascade_engine::step::StepContext;
use cascade_nodes::BuiltinNodeTypes;
use clap::{Args, Parser, Subcommand};
use config::{AppConfig, LoggingConfig};
use serde_json::{Value as JsonValue, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "cascade", version, about = "Durable workflow execution engine")]
struct Cli {
    /// Path of the configuration file.
    #[arg(long, global = true, default_value = "./cascade.config.json")]
    config: PathBuf,

    /// Verbose error output (descriptions and stacks).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Worker process management.
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Submit and inspect workflow executions.
    #[command(subcommand)]
    Workflow(WorkflowCommand),
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Run a worker until SIGINT/SIGTERM.
    Start {
        /// Override the configured task queue.
        #[arg(long)]
        task_queue: Option<String>,
        /// Override the configured step-task concurrency.
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[derive(Debug, Args)]
struct SubmitArgs {
    /// Path of the workflow JSON file.
    #[arg(long)]
    workflow: PathBuf,
    /// Path of a JSON file with the seed input items.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Override the configured task queue.
    #[arg(long)]
    task_queue: Option<String>,
    /// Submit under a specific execution id (ULID).
    #[arg(long)]
    workflow_id: Option<String>,
    /// Emit JSON instead of human-readable output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum WorkflowCommand {
    /// Start an execution and await its result.
    Run {
        #[command(flatten)]
        submit: SubmitArgs,
        /// Give up waiting after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Start an execution and return immediately.
    Start {
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Report an execution's status.
    Status {
        /// The execution id.
        #[arg(long)]
        workflow_id: String,
        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },
    /// Fetch an execution's final output or error.
    Result {
        /// The execution id.
        #[arg(long)]
        workflow_id: String,
        /// Block until the execution finishes.
        #[arg(long)]
        wait: bool,
        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", cli.config.display());
            return 1;
        }
    };

    init_logging(LoggingConfig::effective(config.logging.clone()));

    match cli.command {
        Command::Worker(WorkerCommand::Start {
            task_queue,
            concurrency,
        }) => worker_start(&config, task_queue.as_deref(), concurrency).await,
        Command::Workflow(command) => workflow_command(&config, command, cli.verbose).await,
    }
}

fn init_logging(logging: LoggingConfig) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Builds the collaborator bundle threaded into every step task.
async fn build_step_context(config: &AppConfig) -> Result<StepContext, String> {
    let http = Arc::new(ReqwestRequester::new());

    let credential_store = FileCredentialStore::open(&config.credentials.path)
        .await
        .map_err(|e| format!("failed to open credential store: {e}"))?;
    let credentials = Arc::new(CredentialResolver::new(
        Arc::new(credential_store),
        http.clone(),
    ));

    let binary = config
        .binary_data
        .build()
        .await
        .map_err(|e| format!("failed to initialize binary data store: {e}"))?;

    Ok(StepContext {
        registry: Arc::new(BuiltinNodeTypes::new()),
        collaborators: Collaborators {
            credentials,
            http,
            binary,
            inline_binary_threshold: config.binary_data.inline_threshold_bytes,
        },
    })
}

async fn worker_start(
    config: &AppConfig,
    task_queue: Option<&str>,
    concurrency: Option<usize>,
) -> i32 {
    let step_context = match build_step_context(config).await {
        Ok(context) => context,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    let store = match NatsExecutionStore::connect(config.scheduler.connection(task_queue)).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("failed to connect to the scheduler substrate: {e}");
            return 1;
        }
    };

    let mut worker_config = config.execution.worker_config(&config.scheduler);
    if let Some(concurrency) = concurrency {
        worker_config.max_concurrent_step_tasks = concurrency;
    }

    if let Some(identity) = &config.scheduler.identity {
        info!(identity = %identity, "worker identity");
    }

    let worker = Arc::new(Worker::new(store, step_context, worker_config));

    // Trap SIGINT/SIGTERM for graceful shutdown.
    let signal_worker = worker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_worker.shutdown();
    });

    match worker.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "worker failed");
            1
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

async fn workflow_command(config: &AppConfig, command: WorkflowCommand, verbose: bool) -> i32 {
    let task_queue = match &command {
        WorkflowCommand::Run { submit, .. } | WorkflowCommand::Start { submit } => {
            submit.task_queue.clone()
        }
        _ => None,
    };

    let store =
        match NatsExecutionStore::connect(config.scheduler.connection(task_queue.as_deref())).await
        {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("failed to connect to the scheduler substrate: {e}");
                return 1;
            }
        };
    let client = ExecutionClient::new(store);

    match command {
        WorkflowCommand::Run { submit, timeout } => {
            let (definition, input) = match load_submission(&submit) {
                Ok(loaded) => loaded,
                Err(message) => {
                    eprintln!("{message}");
                    return 1;
                }
            };
            let execution_id = match submit_execution(&client, &submit, definition, input).await {
                Ok(id) => id,
                Err(e) => return client_failure(&e, verbose),
            };
            let verdict = client
                .result(execution_id, true, timeout.map(Duration::from_secs))
                .await;
            match verdict {
                Ok(verdict) => print_verdict(execution_id, &verdict, submit.json, verbose),
                Err(e) => client_failure(&e, verbose),
            }
        }
        WorkflowCommand::Start { submit } => {
            let (definition, input) = match load_submission(&submit) {
                Ok(loaded) => loaded,
                Err(message) => {
                    eprintln!("{message}");
                    return 1;
                }
            };
            match submit_execution(&client, &submit, definition, input).await {
                Ok(execution_id) => {
                    if submit.json {
                        println!(
                            "{}",
                            json!({"workflowId": execution_id.to_string(), "runId": execution_id.to_string()})
                        );
                    } else {
                        println!("started execution {execution_id}");
                    }
                    0
                }
                Err(e) => client_failure(&e, verbose),
            }
        }
        WorkflowCommand::Status { workflow_id, json } => {
            let execution_id = match parse_execution_id(&workflow_id) {
                Ok(id) => id,
                Err(message) => {
                    eprintln!("{message}");
                    return 1;
                }
            };
            match client.status(execution_id).await {
                Ok(report) => {
                    if json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&report)
                                .unwrap_or_else(|_| "{}".to_string())
                        );
                    } else {
                        println!("execution {execution_id}: {:?}", report.status);
                        if let Some(wait_till) = report.wait_till {
                            println!("  waiting until {wait_till}");
                        }
                        if let Some(last) = &report.last_node_executed {
                            println!("  last node executed: {last}");
                        }
                    }
                    0
                }
                Err(e) => client_failure(&e, verbose),
            }
        }
        WorkflowCommand::Result {
            workflow_id,
            wait,
            json,
        } => {
            let execution_id = match parse_execution_id(&workflow_id) {
                Ok(id) => id,
                Err(message) => {
                    eprintln!("{message}");
                    return 1;
                }
            };
            match client.result(execution_id, wait, None).await {
                Ok(verdict) => print_verdict(execution_id, &verdict, json, verbose),
                Err(e) => client_failure(&e, verbose),
            }
        }
    }
}

async fn submit_execution(
    client: &ExecutionClient<NatsExecutionStore>,
    submit: &SubmitArgs,
    definition: WorkflowDefinition,
    input: Option<Vec<ExecutionItem>>,
) -> Result<ExecutionId, ClientError> {
    match &submit.workflow_id {
        Some(requested) => {
            let execution_id = parse_execution_id(requested).map_err(|message| {
                ClientError::InvalidWorkflow(cascade_engine::error::EngineError::Bookkeeping {
                    message,
                })
            })?;
            client
                .start_with_id(execution_id, definition, input)
                .await
        }
        None => client.start(definition, input).await,
    }
}

fn client_failure(error: &ClientError, verbose: bool) -> i32 {
    eprintln!("{error}");
    if verbose {
        eprintln!("  {error:?}");
    }
    1
}

fn parse_execution_id(text: &str) -> Result<ExecutionId, String> {
    text.parse()
        .map_err(|e| format!("invalid execution id '{text}': {e}"))
}

/// Reads the workflow file and optional input file.
fn load_submission(
    submit: &SubmitArgs,
) -> Result<(WorkflowDefinition, Option<Vec<ExecutionItem>>), String> {
    let workflow_text = std::fs::read_to_string(&submit.workflow)
        .map_err(|e| format!("failed to read {}: {e}", submit.workflow.display()))?;
    let definition = WorkflowDefinition::from_json(&workflow_text)
        .map_err(|e| format!("invalid workflow file {}: {e}", submit.workflow.display()))?;

    let input = match &submit.input {
        None => None,
        Some(path) => {
            let input_text = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            let value: JsonValue = serde_json::from_str(&input_text)
                .map_err(|e| format!("invalid input file {}: {e}", path.display()))?;
            Some(parse_input_items(value))
        }
    };

    Ok((definition, input))
}

/// Accepts either a list of items (`[{"json": …}, …]` or plain values) or
/// a single value, which becomes a one-item input.
fn parse_input_items(value: JsonValue) -> Vec<ExecutionItem> {
    match value {
        JsonValue::Array(values) => values
            .into_iter()
            .map(|v| {
                // Already-shaped items pass through unchanged.
                serde_json::from_value::<ExecutionItem>(v.clone())
                    .ok()
                    .filter(|_| v.get("json").is_some())
                    .unwrap_or_else(|| ExecutionItem::from_json(v))
            })
            .collect(),
        other => vec![ExecutionItem::from_json(other)],
    }
}

fn print_verdict(
    execution_id: ExecutionId,
    verdict: &ExecutionVerdict,
    as_json: bool,
    verbose: bool,
) -> i32 {
    if as_json {
        let payload = json!({
            "workflowId": execution_id.to_string(),
            "success": verdict.success,
            "status": verdict.status,
            "data": verdict.data,
            "error": verdict.error,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
        );
    } else if verdict.success {
        println!("execution {execution_id} succeeded");
        if let Some(data) = &verdict.data {
            println!(
                "{}",
                serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
            );
        }
    } else if let Some(error) = &verdict.error {
        print_error_block(error, verbose);
    } else {
        println!("execution {execution_id} ended: {:?}", verdict.status);
    }

    if verdict.success { 0 } else { 1 }
}

fn print_error_block(error: &SerializedError, verbose: bool) {
    eprintln!("execution failed: {}", error.message);
    if let Some(node) = &error.node {
        eprintln!("  node: {node}");
    }
    if let Some(description) = &error.description {
        eprintln!("  {description}");
    }
    if verbose && let Some(stack) = &error.stack {
        eprintln!("{stack}");
    }
}
