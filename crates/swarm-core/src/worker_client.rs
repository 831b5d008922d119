//! HTTP client for the worker wire contract (`GET /health`,
//! `POST /execute`).
//!
//! Workers are opaque remote processes; this client only knows the two
//! endpoints and the accept/busy protocol. Every call is bounded by the
//! dispatch timeout.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::coord::WorkItem;

/// Errors from talking to a worker. All of them are dispatch transients:
/// the item goes back on the queue.
#[derive(Debug, Error)]
pub enum WorkerClientError {
    #[error("worker request failed: {0}")]
    Transport(String),

    #[error("worker returned unexpected HTTP {0}")]
    UnexpectedStatus(u16),

    #[error("worker response unparsable: {0}")]
    BadResponse(String),
}

/// Outcome of an execute request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Worker accepted the subtask.
    Accepted { worker_id: String },
    /// Worker refused with 503.
    Busy,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    status: String,
    worker_id: String,
}

/// Health report from a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerHealth {
    pub status: String,
    pub worker_id: String,
    pub available: bool,
    #[serde(default)]
    pub current_subtask: Option<String>,
}

/// Client for dispatcher -> worker calls.
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(dispatch_timeout: Duration) -> Result<Self, WorkerClientError> {
        let http = reqwest::Client::builder()
            .timeout(dispatch_timeout)
            .build()
            .map_err(|e| WorkerClientError::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    /// POST a work item to a worker's `/execute` endpoint.
    pub async fn execute(
        &self,
        endpoint: &str,
        item: &WorkItem,
    ) -> Result<DispatchOutcome, WorkerClientError> {
        let url = format!("{}/execute", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(item)
            .send()
            .await
            .map_err(|e| WorkerClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Ok(DispatchOutcome::Busy);
        }
        if !status.is_success() {
            return Err(WorkerClientError::UnexpectedStatus(status.as_u16()));
        }

        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| WorkerClientError::BadResponse(e.to_string()))?;

        if parsed.status != "accepted" {
            return Err(WorkerClientError::BadResponse(format!(
                "unexpected execute status {:?}",
                parsed.status
            )));
        }

        Ok(DispatchOutcome::Accepted {
            worker_id: parsed.worker_id,
        })
    }

    /// GET a worker's `/health` endpoint.
    pub async fn health(&self, endpoint: &str) -> Result<WorkerHealth, WorkerClientError> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| WorkerClientError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerClientError::UnexpectedStatus(status.as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| WorkerClientError::BadResponse(e.to_string()))
    }
}
