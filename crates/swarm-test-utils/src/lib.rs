//! Shared test utilities for swarm integration tests.
//!
//! Provides a PostgreSQL instance shared across tests (each test gets its
//! own database within the instance), a scripted planner, and a mock worker
//! HTTP server that speaks the worker wire contract.
//!
//! Two database modes:
//! - **`SWARM_TEST_PG_URL`** set (nextest setup script): use the external
//!   container directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via testcontainers,
//!   shared per binary through a `OnceCell`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use swarm_core::coord::{CoordStore, WorkItem};
use swarm_core::planner::{PlanRecord, Planner, PlannerError};
use swarm_core::registry::WorkerRegistration;
use swarm_db::models::{Capability, NewSubTaskResult, Outcome};
use swarm_db::pool;

// ---------------------------------------------------------------------------
// Shared PostgreSQL
// ---------------------------------------------------------------------------

/// Shared container state: base URL and optional container handle (kept alive).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

/// Lazily-initialized shared PostgreSQL.
static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    // If a setup script already started a container, use that directly.
    if let Ok(url) = std::env::var("SWARM_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

    SharedPg {
        base_url,
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL.
///
/// Lazily starts a container on first call (unless `SWARM_TEST_PG_URL` is
/// set). The URL points at the server root (no database name appended).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. The pool connects to a uniquely-named
/// database within the shared instance. Call [`drop_test_db`] with the
/// returned `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    // Connect to the default "postgres" database to issue CREATE DATABASE.
    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database in container");

    let db_name = format!("swarm_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    // Connect to the new database and run migrations.
    let temp_url = format!("{base_url}/{db_name}");
    let temp_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&temp_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool)
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database.
///
/// Terminates existing connections and drops the database. Safe to call
/// even if the database was already dropped.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    // Terminate existing connections first.
    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}

// ---------------------------------------------------------------------------
// Scripted planner
// ---------------------------------------------------------------------------

/// Planner that replays canned records (or a canned failure).
pub struct ScriptedPlanner {
    records: Option<Vec<PlanRecord>>,
}

impl ScriptedPlanner {
    /// A planner that always returns the given records.
    pub fn new(records: Vec<PlanRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Some(records),
        })
    }

    /// A planner that always fails, forcing the decomposer fallback.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self { records: None })
    }

    /// Convenience record constructor.
    pub fn record(
        description: &str,
        capabilities: &[Capability],
        dependencies: &[usize],
        priority: i64,
    ) -> PlanRecord {
        PlanRecord {
            description: description.to_string(),
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            dependencies: dependencies.to_vec(),
            priority,
            estimated_duration_seconds: None,
            input_data: serde_json::json!({}),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _description: &str,
        _vocabulary: &[Capability],
    ) -> Result<Vec<PlanRecord>, PlannerError> {
        match &self.records {
            Some(records) => Ok(records.clone()),
            None => Err(PlannerError::Unreachable(
                "scripted planner configured to fail".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock worker
// ---------------------------------------------------------------------------

/// One `/execute` call as seen by a mock worker.
#[derive(Debug, Clone)]
pub struct ReceivedExecute {
    pub item: WorkItem,
    pub at: DateTime<Utc>,
}

/// Computes the result a mock worker reports for a work item. `None` means
/// the worker accepts the subtask and then never reports (a crashed or
/// hung worker).
pub type RespondFn = dyn Fn(&WorkItem) -> Option<NewSubTaskResult> + Send + Sync;

#[derive(Clone)]
struct MockWorkerState {
    id: String,
    coord: Arc<dyn CoordStore>,
    respond: Arc<RespondFn>,
    received: Arc<Mutex<Vec<ReceivedExecute>>>,
    busy: Arc<AtomicBool>,
    delay: Duration,
}

/// An in-process worker speaking the worker wire contract.
///
/// On `/execute` it records the call, waits `delay`, computes its result via
/// the respond function, and pushes it onto the coordination store's result
/// queue -- exactly what a remote worker process would do.
pub struct MockWorker {
    pub id: String,
    pub endpoint: String,
    received: Arc<Mutex<Vec<ReceivedExecute>>>,
    busy: Arc<AtomicBool>,
}

impl MockWorker {
    /// Spawn a mock worker server on an ephemeral port.
    pub async fn spawn(
        id: &str,
        coord: Arc<dyn CoordStore>,
        respond: Arc<RespondFn>,
        delay: Duration,
    ) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let state = MockWorkerState {
            id: id.to_string(),
            coord,
            respond,
            received: Arc::clone(&received),
            busy: Arc::clone(&busy),
            delay,
        };

        let app = Router::new()
            .route("/health", get(health))
            .route("/execute", post(execute))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock worker listener");
        let addr = listener.local_addr().expect("listener has no local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            id: id.to_string(),
            endpoint: format!("http://{addr}"),
            received,
            busy,
        }
    }

    /// A respond function that reports success with a fixed output blob.
    pub fn completing(worker_id: &str, output: serde_json::Value) -> Arc<RespondFn> {
        let worker_id = worker_id.to_string();
        Arc::new(move |item: &WorkItem| {
            Some(NewSubTaskResult {
                task_id: item.task_id,
                subtask_id: item.subtask.id.clone(),
                worker_id: worker_id.clone(),
                outcome: Outcome::Completed,
                output: Some(output.clone()),
                error: None,
                execution_time_seconds: 0.1,
                created_at: Some(Utc::now()),
            })
        })
    }

    /// A respond function that reports failure with a fixed error message.
    pub fn failing(worker_id: &str, error: &str) -> Arc<RespondFn> {
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        Arc::new(move |item: &WorkItem| {
            Some(NewSubTaskResult {
                task_id: item.task_id,
                subtask_id: item.subtask.id.clone(),
                worker_id: worker_id.clone(),
                outcome: Outcome::Failed,
                output: None,
                error: Some(error.clone()),
                execution_time_seconds: 0.1,
                created_at: Some(Utc::now()),
            })
        })
    }

    /// A respond function for a worker that accepts work and then goes
    /// silent.
    pub fn unresponsive() -> Arc<RespondFn> {
        Arc::new(|_item: &WorkItem| None)
    }

    /// Registration payload for this worker.
    pub fn registration(&self, capabilities: &[Capability]) -> WorkerRegistration {
        WorkerRegistration {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            capabilities: capabilities.to_vec(),
        }
    }

    /// Flip the worker into (or out of) 503-busy mode.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Every `/execute` call received so far.
    pub fn received(&self) -> Vec<ReceivedExecute> {
        self.received.lock().expect("received lock poisoned").clone()
    }
}

async fn health(State(state): State<MockWorkerState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "worker_id": state.id,
        "available": !state.busy.load(Ordering::SeqCst),
    }))
}

async fn execute(
    State(state): State<MockWorkerState>,
    Json(item): Json<WorkItem>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.busy.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    state
        .received
        .lock()
        .expect("received lock poisoned")
        .push(ReceivedExecute {
            item: item.clone(),
            at: Utc::now(),
        });

    let response = serde_json::json!({
        "status": "accepted",
        "worker_id": state.id,
    });

    tokio::spawn(async move {
        tokio::time::sleep(state.delay).await;
        if let Some(result) = (state.respond)(&item) {
            if let Ok(raw) = serde_json::to_string(&result) {
                let _ = state.coord.push_result(raw).await;
            }
        }
    });

    Ok(Json(response))
}
