//! HTTP planner backend.
//!
//! POSTs the task description and the capability vocabulary to a configured
//! endpoint and expects `{"subtasks": [PlanRecord, ...]}` back. The service
//! behind the endpoint (and whatever LLM it wraps) is out of scope here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use swarm_db::models::Capability;

use super::{PlanRecord, Planner, PlannerError};

#[derive(Debug, Serialize)]
struct PlanRequest<'a> {
    description: &'a str,
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    subtasks: Vec<PlanRecord>,
}

/// Planner backed by a remote HTTP service.
pub struct HttpPlanner {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPlanner {
    /// Build a planner client. `timeout` bounds the whole call; on expiry
    /// the decomposer takes the fallback path.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PlannerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlannerError::Unreachable(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(
        &self,
        description: &str,
        vocabulary: &[Capability],
    ) -> Result<Vec<PlanRecord>, PlannerError> {
        let request = PlanRequest {
            description,
            capabilities: vocabulary.iter().map(|c| c.to_string()).collect(),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PlannerError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PlannerError::Unreachable(format!(
                "planner returned HTTP {}",
                response.status()
            )));
        }

        let parsed: PlanResponse = response
            .json()
            .await
            .map_err(|e| PlannerError::BadPlan(e.to_string()))?;

        Ok(parsed.subtasks)
    }
}
