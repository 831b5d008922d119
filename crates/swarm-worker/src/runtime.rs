//! Worker runtime: the wire-contract server (`/health`, `/execute`), the
//! heartbeat ticker, and the execute-and-report flow.
//!
//! One worker executes one subtask at a time; while busy it refuses new
//! work with 503 and the dispatcher re-enqueues. Heartbeats run on their
//! own task with a ticker and re-register automatically if the worker aged
//! out of the orchestrator's registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use swarm_core::coord::WorkItem;
use swarm_core::registry::HeartbeatUpdate;
use swarm_db::models::{Capability, LogLevel, NewSubTaskResult, Outcome};

use crate::client::OrchestratorClient;
use crate::executor::Executor;

/// How many times a finished result is retried against the orchestrator
/// before giving up.
const RESULT_DELIVERY_ATTEMPTS: u32 = 5;

/// Pause between result delivery attempts.
const RESULT_DELIVERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Static configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub orchestrator_url: String,
    pub bind: String,
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Endpoint to advertise to the orchestrator. Defaults to the bound
    /// address, which is right for single-host deployments.
    pub public_endpoint: Option<String>,
    pub capabilities: Vec<Capability>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

struct WorkerState {
    config: WorkerConfig,
    executor: Arc<dyn Executor>,
    client: OrchestratorClient,
    /// Id of the subtask currently executing, if any.
    current: Mutex<Option<String>>,
    completed_count: AtomicI64,
}

impl WorkerState {
    async fn heartbeat_update(&self) -> HeartbeatUpdate {
        let current = self.current.lock().await.clone();
        HeartbeatUpdate {
            available: current.is_none(),
            current_subtask_id: current,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            completed_count: self.completed_count.load(Ordering::SeqCst),
        }
    }
}

/// Run a worker until the token is cancelled.
///
/// Registers with the orchestrator, serves the wire contract, and
/// heartbeats on a ticker. On shutdown a final heartbeat marks the worker
/// unavailable (the TTL would expire it regardless).
pub async fn run_worker(
    config: WorkerConfig,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url, config.request_timeout)?;

    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.bind, config.port))?;
    let addr = listener.local_addr().context("listener has no local addr")?;
    let endpoint = config
        .public_endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{addr}"));

    client
        .register(&config.worker_id, &endpoint, &config.capabilities)
        .await
        .context("initial registration failed")?;
    tracing::info!(
        worker_id = %config.worker_id,
        endpoint = %endpoint,
        capabilities = ?config.capabilities,
        "worker registered"
    );

    let state = Arc::new(WorkerState {
        config: config.clone(),
        executor,
        client: client.clone(),
        current: Mutex::new(None),
        completed_count: AtomicI64::new(0),
    });

    let heartbeat_handle = tokio::spawn(heartbeat_loop(
        Arc::clone(&state),
        endpoint.clone(),
        cancel.clone(),
    ));

    let app = Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .with_state(Arc::clone(&state));

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("worker http server failed")?;

    // Parting heartbeat so the orchestrator sees the worker go away before
    // the TTL does.
    let mut farewell = state.heartbeat_update().await;
    farewell.available = false;
    let _ = client.heartbeat(&config.worker_id, &farewell).await;

    let _ = heartbeat_handle.await;
    tracing::info!(worker_id = %config.worker_id, "worker stopped");
    Ok(())
}

/// Heartbeat on a ticker until cancelled. Re-registers when the
/// orchestrator has forgotten this worker.
async fn heartbeat_loop(state: Arc<WorkerState>, endpoint: String, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let update = state.heartbeat_update().await;
        if let Err(e) = state.client.heartbeat(&state.config.worker_id, &update).await {
            tracing::warn!(error = %e, "heartbeat failed, attempting re-registration");
            if let Err(e) = state
                .client
                .register(&state.config.worker_id, &endpoint, &state.config.capabilities)
                .await
            {
                tracing::warn!(error = %e, "re-registration failed, will retry next tick");
            }
        }
    }
}

async fn health(State(state): State<Arc<WorkerState>>) -> Json<serde_json::Value> {
    let current = state.current.lock().await.clone();
    Json(serde_json::json!({
        "status": "healthy",
        "worker_id": state.config.worker_id,
        "available": current.is_none(),
        "current_subtask": current,
    }))
}

async fn execute(
    State(state): State<Arc<WorkerState>>,
    Json(item): Json<WorkItem>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    {
        let mut current = state.current.lock().await;
        if current.is_some() {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        *current = Some(item.subtask.id.clone());
    }

    tracing::info!(
        task_id = %item.task_id,
        subtask_id = %item.subtask.id,
        "subtask accepted"
    );

    let response = serde_json::json!({
        "status": "accepted",
        "worker_id": state.config.worker_id,
    });

    let worker_state = Arc::clone(&state);
    tokio::spawn(async move {
        run_subtask(worker_state, item).await;
    });

    Ok(Json(response))
}

/// Execute one accepted subtask and deliver its result.
async fn run_subtask(state: Arc<WorkerState>, item: WorkItem) {
    let started = tokio::time::Instant::now();
    let executed = state.executor.execute(&item).await;
    // The wire contract requires a strictly positive execution time.
    let execution_time_seconds = started.elapsed().as_secs_f64().max(0.001);

    let result = match executed {
        Ok(output) => {
            state.completed_count.fetch_add(1, Ordering::SeqCst);
            NewSubTaskResult {
                task_id: item.task_id,
                subtask_id: item.subtask.id.clone(),
                worker_id: state.config.worker_id.clone(),
                outcome: Outcome::Completed,
                output: Some(output),
                error: None,
                execution_time_seconds,
                created_at: Some(chrono::Utc::now()),
            }
        }
        Err(e) => {
            tracing::warn!(
                task_id = %item.task_id,
                subtask_id = %item.subtask.id,
                error = %e,
                "subtask execution failed"
            );
            NewSubTaskResult {
                task_id: item.task_id,
                subtask_id: item.subtask.id.clone(),
                worker_id: state.config.worker_id.clone(),
                outcome: Outcome::Failed,
                output: None,
                error: Some(e.to_string()),
                execution_time_seconds,
                created_at: Some(chrono::Utc::now()),
            }
        }
    };

    deliver_result(&state, &result).await;

    let _ = state
        .client
        .post_log(
            &state.config.worker_id,
            Some(item.task_id),
            match result.outcome {
                Outcome::Completed => LogLevel::Info,
                Outcome::Failed => LogLevel::Error,
            },
            &format!("subtask {} finished: {}", item.subtask.id, result.outcome),
        )
        .await;

    *state.current.lock().await = None;
}

/// Push a result to the orchestrator, retrying transient failures. Result
/// ingestion is idempotent on the orchestrator side, so retrying after an
/// ambiguous failure is safe.
async fn deliver_result(state: &WorkerState, result: &NewSubTaskResult) {
    for attempt in 1..=RESULT_DELIVERY_ATTEMPTS {
        match state.client.post_result(result).await {
            Ok(()) => return,
            Err(e) if attempt < RESULT_DELIVERY_ATTEMPTS => {
                tracing::warn!(
                    subtask_id = %result.subtask_id,
                    attempt,
                    error = %e,
                    "result delivery failed, retrying"
                );
                tokio::time::sleep(RESULT_DELIVERY_RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::error!(
                    subtask_id = %result.subtask_id,
                    error = %e,
                    "result delivery failed permanently, dropping result"
                );
            }
        }
    }
}

/// Parse a comma-separated capability list (e.g.
/// `data_analysis,web_scraping`).
pub fn parse_capabilities(raw: &str) -> Result<Vec<Capability>> {
    let mut capabilities = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let capability: Capability = part
            .parse()
            .map_err(|e| anyhow::anyhow!("{e} (valid: {})", vocabulary_hint()))?;
        if !capabilities.contains(&capability) {
            capabilities.push(capability);
        }
    }
    if capabilities.is_empty() {
        anyhow::bail!("at least one capability is required");
    }
    Ok(capabilities)
}

fn vocabulary_hint() -> String {
    Capability::ALL
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capability_list() {
        let caps = parse_capabilities("data_analysis, web_scraping,data_analysis").unwrap();
        assert_eq!(
            caps,
            vec![Capability::DataAnalysis, Capability::WebScraping]
        );
    }

    #[test]
    fn parse_rejects_unknown_capability() {
        let err = parse_capabilities("data_analysis,teleportation").unwrap_err();
        assert!(err.to_string().contains("teleportation"));
    }

    #[test]
    fn parse_rejects_empty_list() {
        assert!(parse_capabilities("").is_err());
        assert!(parse_capabilities(" , ").is_err());
    }
}
