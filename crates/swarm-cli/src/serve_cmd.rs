use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use swarm_core::coord::{CoordError, CoordStore, WorkerStatus};
use swarm_core::registry::{HeartbeatUpdate, Registry, RegistryError, WorkerRegistration};
use swarm_core::service::{RetryOutcome, ServiceError, TaskService};
use swarm_db::models::{Capability, LogLevel, NewSubTaskResult};
use swarm_db::queries::activity_logs::{self, NewActivityLog};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    /// Internal errors hide their detail from the client; a coordination
    /// store outage maps to 503 so callers know to retry.
    pub fn internal(err: anyhow::Error) -> Self {
        if err.downcast_ref::<CoordError>().is_some() {
            return Self::unavailable("coordination store unavailable");
        }
        tracing::error!(error = format!("{err:#}"), "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }

    fn from_service(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidDescription(_) => Self::bad_request(err.to_string()),
            ServiceError::TaskNotFound(_) => Self::not_found(err.to_string()),
            ServiceError::InvalidState { .. } => Self::conflict(err.to_string()),
            ServiceError::Internal(inner) => Self::internal(inner),
        }
    }

    fn from_registry(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorker(_) => Self::not_found(err.to_string()),
            RegistryError::NoCapabilities => Self::bad_request(err.to_string()),
            RegistryError::Coord(inner) => Self::internal(inner.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub description: String,
    #[serde(default)]
    pub submitter_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub status: &'static str,
    pub subtasks_count: usize,
    pub initial_subtasks_queued: usize,
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    #[serde(default)]
    pub capability: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailableResponse {
    pub available: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub worker_id: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct QueueDepthsResponse {
    pub work_queue: usize,
    pub result_queue: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub coord: Arc<dyn CoordStore>,
    pub registry: Arc<Registry>,
    pub service: Arc<TaskService>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/{task_id}", get(get_task))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/tasks/{task_id}/retry", post(retry_task))
        .route("/workers", get(list_workers))
        .route("/workers/available", get(list_available_workers))
        .route("/workers/register", post(register_worker))
        .route("/workers/{worker_id}/heartbeat", post(heartbeat))
        .route("/results", post(ingest_result))
        .route("/logs", post(ingest_log))
        .route("/queues", get(queue_depths))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("swarm serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("swarm serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<axum::response::Response, AppError> {
    let outcome = state
        .service
        .submit(&req.description, req.submitter_id.as_deref())
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(SubmitResponse {
        task_id: outcome.task_id,
        status: "created",
        subtasks_count: outcome.subtasks_count,
        initial_subtasks_queued: outcome.initial_subtasks_queued,
    })
    .into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let detail = state
        .service
        .get_task(task_id)
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(detail).into_response())
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .service
        .cancel(task_id)
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(serde_json::json!({
        "task_id": task.id,
        "state": task.state,
    }))
    .into_response())
}

async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let outcome: RetryOutcome = state
        .service
        .retry(task_id)
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(outcome).into_response())
}

// ---------------------------------------------------------------------------
// Worker handlers
// ---------------------------------------------------------------------------

async fn list_workers(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let workers = state
        .service
        .list_workers()
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(WorkersResponse { workers }).into_response())
}

async fn list_available_workers(
    State(state): State<AppState>,
    Query(query): Query<AvailableQuery>,
) -> Result<axum::response::Response, AppError> {
    let capability = match query.capability.as_deref() {
        Some(raw) => Some(
            raw.parse::<Capability>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        ),
        None => None,
    };

    let available = state
        .service
        .list_available_workers(capability)
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(AvailableResponse {
        count: available.len(),
        available,
    })
    .into_response())
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegistration>,
) -> Result<axum::response::Response, AppError> {
    let worker = state
        .registry
        .register(req)
        .await
        .map_err(AppError::from_registry)?;

    Ok(Json(serde_json::json!({
        "status": "registered",
        "worker": worker,
    }))
    .into_response())
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(update): Json<HeartbeatUpdate>,
) -> Result<axum::response::Response, AppError> {
    let worker = state
        .registry
        .heartbeat(&worker_id, update)
        .await
        .map_err(AppError::from_registry)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "worker": worker,
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// Ingestion handlers (worker-facing)
// ---------------------------------------------------------------------------

async fn ingest_result(
    State(state): State<AppState>,
    Json(result): Json<NewSubTaskResult>,
) -> Result<axum::response::Response, AppError> {
    let raw = serde_json::to_string(&result)
        .map_err(|e| AppError::internal(anyhow::Error::from(e)))?;
    state
        .coord
        .push_result(raw)
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    Ok(Json(serde_json::json!({"status": "queued"})).into_response())
}

async fn ingest_log(
    State(state): State<AppState>,
    Json(req): Json<LogRequest>,
) -> Result<axum::response::Response, AppError> {
    let new = NewActivityLog {
        worker_id: req.worker_id,
        task_id: req.task_id,
        level: req.level,
        message: req.message,
        metadata: req.metadata,
    };
    activity_logs::insert_activity_log(&state.pool, &new)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({"status": "ok"})).into_response())
}

async fn queue_depths(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let (work, result) = state
        .service
        .queue_depths()
        .await
        .map_err(AppError::from_service)?;

    Ok(Json(QueueDepthsResponse {
        work_queue: work,
        result_queue: result,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
