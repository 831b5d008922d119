//! The `Planner` trait -- the external call boundary that turns a task
//! description into raw subtask specs.
//!
//! The planner is opaque: prompt wording, model, and vendor live behind the
//! trait. The orchestrator only sees the record list and treats every
//! planner defect (unreachable, unparsable, cyclic output) the same way:
//! the decomposer falls back to a single-subtask plan.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use swarm_db::models::Capability;

pub use http::HttpPlanner;

/// Errors from the planner boundary. All variants are recovered locally by
/// the decomposer's fallback; none of them fail a submission.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner unreachable: {0}")]
    Unreachable(String),

    #[error("planner output unparsable: {0}")]
    BadPlan(String),
}

/// One raw subtask spec as produced by the planner, before validation.
///
/// `dependencies` are 0-based indices into earlier entries of the same
/// response; the decomposer rewrites them into minted subtask ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default, alias = "dependencies_indices")]
    pub dependencies: Vec<usize>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(
        default,
        alias = "estimated_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub estimated_duration_seconds: Option<u64>,
    #[serde(default)]
    pub input_data: serde_json::Value,
}

fn default_priority() -> i64 {
    5
}

/// Adapter interface for plan generation backends.
///
/// Object-safe so it can be stored as `Arc<dyn Planner>` and injected into
/// the decomposer.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce raw subtask specs for a task description.
    ///
    /// `vocabulary` is the full capability enum, passed so the backend can
    /// constrain its output; records may still reference strings outside it
    /// and the decomposer will drop those.
    async fn plan(
        &self,
        description: &str,
        vocabulary: &[Capability],
    ) -> Result<Vec<PlanRecord>, PlannerError>;
}

// Compile-time assertion: Planner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Planner) {}
};
