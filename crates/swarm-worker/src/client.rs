//! HTTP client for the orchestrator's worker-facing surface: registration,
//! heartbeats, result delivery, and activity logs.

use std::time::Duration;

use anyhow::{Context, Result, bail};

use swarm_core::registry::{HeartbeatUpdate, WorkerRegistration};
use swarm_db::models::{Capability, LogLevel, NewSubTaskResult};

/// Client handle for one orchestrator.
#[derive(Clone)]
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build orchestrator http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach orchestrator at {url}"))?;

        let status = response.status();
        let json: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));

        if !status.is_success() {
            let message = json["error"].as_str().unwrap_or("unknown error");
            bail!("orchestrator returned {status} for {path}: {message}");
        }
        Ok(json)
    }

    /// Register this worker with the orchestrator.
    pub async fn register(
        &self,
        worker_id: &str,
        endpoint: &str,
        capabilities: &[Capability],
    ) -> Result<()> {
        let registration = WorkerRegistration {
            id: worker_id.to_string(),
            endpoint: endpoint.to_string(),
            capabilities: capabilities.to_vec(),
        };
        self.post_json("/workers/register", &serde_json::to_value(&registration)?)
            .await?;
        Ok(())
    }

    /// Send a heartbeat. Returns an error when the orchestrator no longer
    /// knows this worker (TTL expired); the caller should re-register.
    pub async fn heartbeat(&self, worker_id: &str, update: &HeartbeatUpdate) -> Result<()> {
        self.post_json(
            &format!("/workers/{worker_id}/heartbeat"),
            &serde_json::to_value(update)?,
        )
        .await?;
        Ok(())
    }

    /// Deliver a subtask result.
    pub async fn post_result(&self, result: &NewSubTaskResult) -> Result<()> {
        self.post_json("/results", &serde_json::to_value(result)?)
            .await?;
        Ok(())
    }

    /// Append an activity log entry on the orchestrator side. Best-effort
    /// from the caller's perspective.
    pub async fn post_log(
        &self,
        worker_id: &str,
        task_id: Option<uuid::Uuid>,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        self.post_json(
            "/logs",
            &serde_json::json!({
                "worker_id": worker_id,
                "task_id": task_id,
                "level": level,
                "message": message,
            }),
        )
        .await?;
        Ok(())
    }
}
