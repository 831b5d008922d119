mod client;
mod config;
mod serve_cmd;
mod status_cmd;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};

use swarm_core::coord::{CoordStore, MemoryCoordStore};
use swarm_core::decompose::Decomposer;
use swarm_core::planner::{HttpPlanner, PlanRecord, Planner, PlannerError};
use swarm_core::registry::Registry;
use swarm_core::runtime::OrchestratorRuntime;
use swarm_core::service::TaskService;
use swarm_db::models::Capability;
use swarm_db::pool;

use client::DEFAULT_SERVER;
use config::SwarmCliConfig;
use serve_cmd::AppState;

#[derive(Parser)]
#[command(name = "swarm", about = "Multi-agent task decomposition and dispatch orchestrator")]
struct Cli {
    /// Database URL (overrides SWARM_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a swarm config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/swarm")]
        db_url: String,
        /// HTTP planner endpoint (omit to decompose via the fallback only)
        #[arg(long)]
        planner_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the swarm database (requires config file or env vars)
    DbInit,
    /// Run the orchestrator: HTTP API plus dispatcher and result loops
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Submit a task to a running orchestrator
    Submit {
        /// Natural-language task description
        description: String,
        /// Submitter id to record on the task
        #[arg(long)]
        submitter: Option<String>,
        /// Orchestrator base URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show task status (omit task_id to list recent tasks)
    Status {
        /// Task ID to show
        task_id: Option<String>,
    },
    /// List live workers on a running orchestrator
    Workers {
        /// Orchestrator base URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Cancel a pending or running task
    Cancel {
        /// Task ID to cancel
        task_id: String,
        /// Orchestrator base URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Retry a failed task (or re-enqueue a running task's stuck subtasks)
    Retry {
        /// Task ID to retry
        task_id: String,
        /// Orchestrator base URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

/// Planner used when no endpoint is configured: always fails, so every
/// submission decomposes through the single-subtask fallback.
struct UnconfiguredPlanner;

#[async_trait]
impl Planner for UnconfiguredPlanner {
    async fn plan(
        &self,
        _description: &str,
        _vocabulary: &[Capability],
    ) -> Result<Vec<PlanRecord>, PlannerError> {
        Err(PlannerError::Unreachable("no planner configured".into()))
    }
}

/// Execute the `swarm init` command: write the config file.
fn cmd_init(db_url: &str, planner_url: Option<String>, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        planner: config::PlannerSection {
            url: planner_url.clone(),
        },
        orchestrator: Default::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    match planner_url {
        Some(url) => println!("  planner.url  = {url}"),
        None => println!("  planner.url  = (unset; submissions use the fallback decomposition)"),
    }
    println!();
    println!("Next: run `swarm db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `swarm db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = SwarmCliConfig::resolve(cli_db_url)?;

    println!("Initializing swarm database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("Database ready at {}", resolved.db_config.database_url);
    Ok(())
}

/// Execute the `swarm serve` command: wire the core and run until Ctrl+C.
async fn cmd_serve(cli_db_url: Option<&str>, bind: &str, port: u16) -> Result<()> {
    let resolved = SwarmCliConfig::resolve(cli_db_url)?;
    let swarm_config = resolved.orchestrator.clone();

    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
    let registry = Arc::new(Registry::new(
        Arc::clone(&coord),
        swarm_config.liveness_window(),
    ));

    let planner: Arc<dyn Planner> = match &resolved.planner_url {
        Some(url) => Arc::new(
            HttpPlanner::new(url, swarm_config.planner_timeout())
                .map_err(|e| anyhow::anyhow!("failed to build planner client: {e}"))?,
        ),
        None => {
            tracing::warn!(
                "no planner configured; every submission decomposes to the single-subtask fallback"
            );
            Arc::new(UnconfiguredPlanner)
        }
    };

    let service = Arc::new(TaskService::new(
        db_pool.clone(),
        Arc::clone(&coord),
        Arc::clone(&registry),
        Decomposer::new(planner),
        swarm_config.clone(),
    ));

    let runtime = OrchestratorRuntime::start(
        db_pool.clone(),
        Arc::clone(&coord),
        Arc::clone(&registry),
        swarm_config,
    )
    .map_err(|e| anyhow::anyhow!("failed to start orchestrator runtime: {e}"))?;

    let state = AppState {
        pool: db_pool,
        coord,
        registry,
        service,
    };
    serve_cmd::run_serve(state, bind, port).await?;

    runtime.shutdown().await;
    Ok(())
}

/// Execute the `swarm status` command.
async fn cmd_status(cli_db_url: Option<&str>, task_id: Option<&str>) -> Result<()> {
    let resolved = SwarmCliConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let parsed = match task_id {
        Some(raw) => Some(
            raw.parse::<uuid::Uuid>()
                .with_context(|| format!("invalid task id {raw:?}"))?,
        ),
        None => None,
    };

    let result = status_cmd::run_status(&db_pool, parsed).await;
    db_pool.close().await;
    result
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
    let cli_db_url = cli.database_url.as_deref();

    match cli.command {
        Commands::Init {
            db_url,
            planner_url,
            force,
        } => cmd_init(&db_url, planner_url, force),
        Commands::DbInit => cmd_db_init(cli_db_url).await,
        Commands::Serve { bind, port } => cmd_serve(cli_db_url, &bind, port).await,
        Commands::Submit {
            description,
            submitter,
            server,
        } => client::cmd_submit(&server, &description, submitter.as_deref()).await,
        Commands::Status { task_id } => cmd_status(cli_db_url, task_id.as_deref()).await,
        Commands::Workers { server } => client::cmd_workers(&server).await,
        Commands::Cancel { task_id, server } => client::cmd_cancel(&server, &task_id).await,
        Commands::Retry { task_id, server } => client::cmd_retry(&server, &task_id).await,
    }
}
