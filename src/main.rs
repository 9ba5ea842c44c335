use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use batch_lite::api::run_api;
use batch_lite::capacity::StaticSpotSignal;
use batch_lite::client::ApiClient;
use batch_lite::config::OrchestratorConfig;
use batch_lite::orchestrator::{DefinitionSubmission, Orchestrator, SubmitRequest};
use batch_lite::scheduler::job::{Dependency, JobId, JobRun, JobSpec, JobState};
use batch_lite::shutdown::install_shutdown_handler;
use batch_lite::telemetry::TracingSink;
use batch_lite::worker::DockerExecutor;

#[derive(Parser, Debug)]
#[command(name = "batch-lite")]
#[command(version)]
#[command(about = "A batch job orchestrator with queues, capacity pools and retries")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator and its HTTP API
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Job queue commands
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ListCommand,
    },

    /// Capacity pool commands
    Pool {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ListCommand,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// YAML configuration file (pools, queues, job definitions).
    /// Without it the built-in stack is used.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address for the HTTP API, overriding the configuration
    #[arg(long)]
    api_addr: Option<SocketAddr>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job, either from a spec file or from a job definition
    Submit(SubmitArgs),
    /// Get status of a specific job
    Status {
        /// The job ID
        job_id: String,
    },
    /// Cancel a job that has not finished
    Cancel {
        /// The job ID
        job_id: String,

        /// Reason recorded on the job
        #[arg(long)]
        reason: Option<String>,
    },
    /// List jobs
    List {
        /// Only show jobs in this state (e.g. RUNNABLE)
        #[arg(long)]
        state: Option<String>,
    },
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Job spec file (YAML or JSON); other flags are ignored when given
    #[arg(long, short = 'f', conflicts_with = "definition")]
    file: Option<PathBuf>,

    /// Job ID
    #[arg(long, required_unless_present = "file")]
    id: Option<String>,

    /// Target job queue
    #[arg(long, required_unless_present = "file")]
    queue: Option<String>,

    /// Job definition to instantiate
    #[arg(long, required_unless_present = "file")]
    definition: Option<String>,

    /// Override the definition's command
    #[arg(long)]
    command: Option<String>,

    /// Number of array children (0 for a plain job)
    #[arg(long, default_value = "0")]
    array_size: u32,

    /// Scheduling priority inside the queue
    #[arg(long, default_value = "0")]
    priority: i32,

    /// Job IDs that must succeed first (repeatable)
    #[arg(long = "depends-on")]
    depends_on: Vec<String>,

    /// Fail an array job on its first failed child
    #[arg(long)]
    fail_fast: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ListCommand {
    /// List all
    List,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            OrchestratorConfig::load(path)?
        }
        None => OrchestratorConfig::default(),
    };
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }

    let api_addr = config.api_addr;
    let executor = Arc::new(DockerExecutor::new(config.sandbox.clone()));
    let signal = Arc::new(StaticSpotSignal::new(config.spot_market.clone()));
    let orchestrator = Orchestrator::new(config, executor, signal, Arc::new(TracingSink))?;

    let shutdown = install_shutdown_handler();

    let control = orchestrator.clone();
    let control_shutdown = shutdown.clone();
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.run(control_shutdown).await {
            tracing::error!(error = %e, "Control loop failed");
        }
    });

    run_api(api_addr, orchestrator, shutdown.clone()).await?;
    shutdown.cancel();
    let _ = control_handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Client Implementation
// =============================================================================

fn load_spec(path: &Path) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let spec = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&contents)?
    } else {
        serde_yaml::from_str(&contents)?
    };
    Ok(spec)
}

fn build_submit_request(args: SubmitArgs) -> Result<SubmitRequest, Box<dyn std::error::Error>> {
    if let Some(path) = &args.file {
        return Ok(SubmitRequest::Spec(load_spec(path)?));
    }
    let (Some(id), Some(queue), Some(definition)) = (args.id, args.queue, args.definition) else {
        return Err("--id, --queue and --definition are required without --file".into());
    };
    let mut submission = DefinitionSubmission::new(id, queue, definition);
    submission.command = args.command;
    submission.array_size = args.array_size;
    submission.priority = args.priority;
    submission.fail_fast = args.fail_fast;
    submission.dependencies = args
        .depends_on
        .into_iter()
        .map(|id| Dependency {
            job_id: JobId::from(id),
            tolerate_failure: false,
        })
        .collect();
    Ok(SubmitRequest::Definition(submission))
}

fn print_run_row(run: &JobRun) {
    let attempts = run.attempt_count();
    println!(
        "{:<36} {:<10} {:<22} {:<9} {}",
        run.job_id.as_str(),
        run.state.to_string(),
        run.spec.queue,
        attempts,
        run.status_reason.as_deref().unwrap_or("")
    );
}

async fn handle_job(
    client: &ApiClient,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit(args) => {
            let request = build_submit_request(args)?;
            let job_id = client.submit(&request).await?;
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "job_id": job_id }));
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job_id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let status = client.job_status(&job_id).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Table => {
                    let run = &status.run;
                    println!("Job ID:     {}", run.job_id);
                    println!("State:      {}", run.state);
                    println!("Queue:      {}", run.spec.queue);
                    println!("Image:      {}", run.spec.image);
                    println!("Attempts:   {}", run.attempt_count());
                    if let Some(reason) = &run.status_reason {
                        println!("Reason:     {}", reason);
                    }
                    if let Some(started) = run.started_at {
                        println!("Started:    {}", started.to_rfc3339());
                    }
                    if let Some(stopped) = run.stopped_at {
                        println!("Stopped:    {}", stopped.to_rfc3339());
                    }
                    let history = run.failure_history();
                    if !history.is_empty() {
                        println!("Failures:");
                        for failure in history {
                            println!("  {:?}: {}", failure.code, failure.message);
                        }
                    }
                    if !status.child_counts.is_empty() {
                        println!("Children:");
                        for (state, count) in &status.child_counts {
                            println!("  {:<10} {}", state, count);
                        }
                    }
                }
            }
        }
        JobCommands::Cancel { job_id, reason } => {
            let run = client.cancel(&job_id, reason).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
                OutputFormat::Table => println!("Job {} is {}", run.job_id, run.state),
            }
        }
        JobCommands::List { state } => {
            let state = state.as_deref().map(str::parse::<JobState>).transpose()?;
            let runs = client.list_jobs(state).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runs)?),
                OutputFormat::Table => {
                    if runs.is_empty() {
                        println!("No jobs found.");
                        return Ok(());
                    }
                    println!(
                        "{:<36} {:<10} {:<22} {:<9} REASON",
                        "JOB ID", "STATE", "QUEUE", "ATTEMPTS"
                    );
                    println!("{}", "-".repeat(96));
                    for run in &runs {
                        print_run_row(run);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_queue_list(
    client: &ApiClient,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let queues = client.list_queues().await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&queues)?),
        OutputFormat::Table => {
            println!(
                "{:<24} {:<9} {:<10} {:<8} {:<9} POOLS",
                "QUEUE", "PRIORITY", "SUBMITTED", "PENDING", "RUNNABLE"
            );
            println!("{}", "-".repeat(90));
            for q in &queues {
                println!(
                    "{:<24} {:<9} {:<10} {:<8} {:<9} {}",
                    q.name,
                    q.priority,
                    q.submitted,
                    q.pending,
                    q.runnable,
                    q.pools.join(",")
                );
            }
        }
    }
    Ok(())
}

async fn handle_pool_list(
    client: &ApiClient,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let pools = client.list_pools().await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&pools)?),
        OutputFormat::Table => {
            println!(
                "{:<22} {:<26} {:<5} {:<11} {:<10} {:<9} INSTANCES",
                "POOL", "STRATEGY", "SPOT", "MIN/MAX", "PROVISION", "RESERVED"
            );
            println!("{}", "-".repeat(100));
            for p in &pools {
                println!(
                    "{:<22} {:<26} {:<5} {:<11} {:<10} {:<9} {}",
                    p.name,
                    p.strategy,
                    p.spot,
                    format!("{}/{}", p.min_vcpus, p.max_vcpus),
                    p.provisioned_vcpus,
                    p.reserved_vcpus,
                    p.instances
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Job { client, command } => {
            let api = ApiClient::new(client.addr);
            handle_job(&api, command, &client.output).await
        }
        Commands::Queue { client, .. } => {
            handle_queue_list(&ApiClient::new(client.addr), &client.output).await
        }
        Commands::Pool { client, .. } => {
            handle_pool_list(&ApiClient::new(client.addr), &client.output).await
        }
    }
}
