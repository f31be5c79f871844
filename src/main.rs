use clap::{Parser, ValueEnum};
use std::fs::OpenOptions;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use fleet_lite::client;
use fleet_lite::config::{MasterConfig, WorkerConfig};
use fleet_lite::control::Command;
use fleet_lite::haproxy;
use fleet_lite::master::{self, ClusterStatus};
use fleet_lite::worker;

#[derive(Parser, Debug)]
#[command(name = "fleet-lite")]
#[command(version)]
#[command(about = "A process-pool supervisor and HTTP load balancer with zero-downtime restarts")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a master. Takes over from a running master on the same control port.
    Start(StartArgs),

    /// Show the state of the worker pool
    Status(ClientArgs),

    /// Gracefully restart every worker, one at a time
    Restart(ClientArgs),

    /// Gracefully stop every worker, then the master
    Stop(ClientArgs),

    /// Print an HAProxy config that fronts the workers of this configuration
    Haproxy(StartArgs),

    /// Run a worker process (spawned by the master)
    #[command(hide = true)]
    Worker,
}

// =============================================================================
// Start Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StartArgs {
    /// Application working directory; `fleet.json` is read from here
    #[arg(default_value = ".")]
    working_directory: PathBuf,

    /// Config file (defaults to <working_directory>/fleet.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind every listener on
    #[arg(long)]
    host: Option<IpAddr>,

    /// Control port
    #[arg(long)]
    port: Option<u16>,

    /// Public load-balancer port (default: control port + 1)
    #[arg(long)]
    balancer_port: Option<u16>,

    /// Number of workers
    #[arg(long)]
    workers: Option<usize>,

    /// Per-worker memory limit in bytes
    #[arg(long)]
    worker_memory_limit: Option<u64>,

    /// Bridge used by workers (hello, static)
    #[arg(long)]
    bridge: Option<String>,

    /// Application passed to the bridge at bootstrap
    #[arg(long)]
    bootstrap: Option<String>,

    /// Application environment
    #[arg(long)]
    app_env: Option<String>,

    /// Seconds without a ping before a worker is killed
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Master control address
    #[arg(long, short = 'a', default_value = "127.0.0.1:5500")]
    addr: SocketAddr,

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
// Helper Functions
// =============================================================================

fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn load_config(args: StartArgs) -> Result<MasterConfig, Box<dyn std::error::Error>> {
    let working_directory = args.working_directory.canonicalize()?;
    let mut config = match &args.config {
        Some(path) => MasterConfig::load(path)?,
        None => MasterConfig::load_from_dir(&working_directory)?,
    };

    config.working_directory = working_directory;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.balancer_port.is_some() {
        config.balancer_port = args.balancer_port;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(limit) = args.worker_memory_limit {
        config.worker_memory_limit = limit;
    }
    if let Some(bridge) = args.bridge {
        config.bridge = bridge;
    }
    if let Some(bootstrap) = args.bootstrap {
        config.bootstrap = bootstrap;
    }
    if let Some(app_env) = args.app_env {
        config.app_env = app_env;
    }
    if args.request_timeout.is_some() {
        config.request_timeout = args.request_timeout;
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file;
    }

    config.validate()?;
    Ok(config)
}

fn format_memory(bytes: Option<u64>) -> String {
    match bytes {
        Some(bytes) => format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0)),
        None => "-".to_string(),
    }
}

fn print_status_table(status: &ClusterStatus) {
    println!("Master Status");
    println!("{}", "=".repeat(40));
    println!("PID:                  {}", status.pid);
    println!("Control:              {}:{}", status.host, status.port);
    println!("Balancer port:        {}", status.balancer_port);
    println!("Workers control port: {}", status.workers_control_port);
    println!("Shutdown lock:        {}", status.shutdown_lock);
    println!("New instances:        {}", status.allow_new_instances);
    println!("Waiting for:          {}", status.waited_workers);
    println!();
    println!("Workers ({}):", status.workers_count);
    println!(
        "{:<8} {:<22} {:<14} {:<10} {:<6} UPTIME",
        "PID", "ADDRESS", "STATUS", "MEMORY", "CPU"
    );
    println!("{}", "-".repeat(72));
    for worker in &status.workers {
        let cpu = worker
            .cpu_percent
            .map(|cpu| format!("{:.1}%", cpu))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<22} {:<14} {:<10} {:<6} {}",
            worker.pid,
            format!("{}:{}", worker.host, worker.port),
            worker.status.to_string(),
            format_memory(worker.memory),
            cpu,
            worker.uptime.as_deref().unwrap_or("-")
        );
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_status(args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let status = client::status(args.addr).await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => print_status_table(&status),
    }
    Ok(())
}

async fn handle_cascade(args: &ClientArgs, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match args.output {
        OutputFormat::Table => {
            let mut stdout = tokio::io::stdout();
            client::stream(args.addr, &command, &mut stdout).await?;
        }
        OutputFormat::Json => {
            let answer = client::request(args.addr, &command).await?;
            let lines: Vec<&str> = answer.lines().collect();
            println!("{}", serde_json::to_string_pretty(&lines)?);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Start(start_args) => {
            let config = load_config(start_args)?;
            init_logging(config.log_file.as_deref())?;
            tracing::info!(
                control = %config.control_addr(),
                balancer = %config.balancer_addr(),
                workers = config.workers,
                bridge = %config.bridge,
                working_directory = %config.working_directory.display(),
                "Starting fleet-lite master"
            );
            if let Err(e) = master::run(config).await {
                tracing::error!(error = %e, "Master failed");
                return Err(e.into());
            }
        }
        Commands::Worker => {
            let config = WorkerConfig::from_env()?;
            init_logging(config.log_file.as_deref())?;
            if let Err(e) = worker::run(config).await {
                tracing::error!(error = %e, "Worker failed");
                return Err(e.into());
            }
        }
        Commands::Haproxy(start_args) => {
            let config = load_config(start_args)?;
            print!("{}", haproxy::render(&config)?);
        }
        Commands::Status(client_args) => handle_status(&client_args).await?,
        Commands::Restart(client_args) => handle_cascade(&client_args, Command::Restart).await?,
        Commands::Stop(client_args) => handle_cascade(&client_args, Command::Stop).await?,
    }

    Ok(())
}
