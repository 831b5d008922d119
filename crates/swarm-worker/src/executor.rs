//! The `Executor` trait -- the adapter interface for subtask execution
//! backends.
//!
//! Each concrete executor turns a dispatched work item into an output blob.
//! The trait is object-safe so a runtime can hold `Arc<dyn Executor>` and
//! deployments can swap the backend without touching the wire plumbing.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use swarm_core::coord::WorkItem;
use swarm_db::models::Capability;

/// Errors from executing a subtask. The runtime reports these back as a
/// `failed` outcome; they never crash the worker.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no executor available for capabilities {0:?}")]
    UnsupportedCapabilities(Vec<Capability>),

    #[error("execution failed: {0}")]
    Failed(String),
}

/// Adapter interface for executing subtasks.
///
/// # Object Safety
///
/// This trait is object-safe: it can be stored as `Arc<dyn Executor>` in
/// the worker runtime.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable name for this executor (e.g. "builtin").
    fn name(&self) -> &str;

    /// Execute one work item and produce its output blob.
    ///
    /// The item's `upstream_context` carries the outputs of every direct
    /// dependency, keyed by subtask id.
    async fn execute(&self, item: &WorkItem) -> Result<serde_json::Value, ExecutorError>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

/// The built-in demonstration executor.
///
/// Produces a structured echo of the subtask: what it was asked to do,
/// which capability handled it, and which upstream outputs were visible.
/// Real deployments replace this with an executor that does actual work;
/// the orchestration core does not care.
///
/// A subtask whose `input_data` contains `"simulate_failure": true` fails
/// on purpose -- handy for exercising the failure path end to end.
pub struct BuiltinExecutor {
    /// Simulated work duration per subtask.
    pub work_duration: Duration,
}

impl BuiltinExecutor {
    pub fn new(work_duration: Duration) -> Self {
        Self { work_duration }
    }
}

#[async_trait]
impl Executor for BuiltinExecutor {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn execute(&self, item: &WorkItem) -> Result<serde_json::Value, ExecutorError> {
        if item.subtask.input_data["simulate_failure"] == serde_json::json!(true) {
            return Err(ExecutorError::Failed(
                "simulated failure requested by input_data".to_string(),
            ));
        }

        let Some(capability) = item.subtask.required_capabilities.first() else {
            return Err(ExecutorError::UnsupportedCapabilities(vec![]));
        };

        tokio::time::sleep(self.work_duration).await;

        let upstream_keys: Vec<&str> = item
            .upstream_context
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();

        Ok(serde_json::json!({
            "handled_by": capability.to_string(),
            "description": item.subtask.description,
            "upstream_keys": upstream_keys,
            "input_data": item.subtask.input_data,
        }))
    }
}
