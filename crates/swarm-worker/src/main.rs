use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use swarm_worker::executor::BuiltinExecutor;
use swarm_worker::runtime::{parse_capabilities, run_worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "swarm-worker", about = "Reference worker for the swarm orchestrator")]
struct Cli {
    /// Worker id (defaults to a generated one)
    #[arg(long)]
    id: Option<String>,

    /// Orchestrator base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    orchestrator: String,

    /// Comma-separated capability list (e.g. data_analysis,web_scraping)
    #[arg(long)]
    capabilities: String,

    /// Bind address for the worker's own HTTP server
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Listen port (0 picks an ephemeral port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Endpoint to advertise to the orchestrator (defaults to the bound
    /// address)
    #[arg(long)]
    public_endpoint: Option<String>,

    /// Heartbeat cadence in seconds
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Simulated work duration per subtask in milliseconds
    #[arg(long, default_value_t = 250)]
    work_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let capabilities = parse_capabilities(&cli.capabilities)?;
    let worker_id = cli
        .id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));

    let config = WorkerConfig {
        worker_id,
        orchestrator_url: cli.orchestrator,
        bind: cli.bind,
        port: cli.port,
        public_endpoint: cli.public_endpoint,
        capabilities,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval),
        request_timeout: Duration::from_secs(5),
    };

    let executor = Arc::new(BuiltinExecutor::new(Duration::from_millis(cli.work_ms)));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    run_worker(config, executor, cancel).await
}
