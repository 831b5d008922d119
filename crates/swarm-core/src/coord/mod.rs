//! The coordination store contract -- queues, worker registry hashes, and
//! shared key/value state.
//!
//! The trait captures the semantic contract the orchestrator relies on:
//! FIFO queues with blocking timeout-bounded dequeue and atomic
//! single-consumer handoff, TTL-expiring worker status hashes, and a small
//! KV surface for worker tools. The store product behind it is deliberately
//! unspecified; [`memory::MemoryCoordStore`] is the in-process
//! implementation, and a networked store plugs in at the same seam.
//!
//! Queue items are JSON strings end to end. Parsing happens at the
//! consumer, which is where poison-message policy lives (log and drop,
//! never re-enqueue).

pub mod memory;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use swarm_db::models::{Capability, SubTask};

pub use memory::MemoryCoordStore;

/// Errors from the coordination store.
///
/// All of these are treated as transient by the long-running loops: log,
/// sleep, retry. Only the API boundary turns them into a 503.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// An item on the work queue: one subtask awaiting dispatch, bundled with
/// the outputs of its completed dependencies.
///
/// The same shape is POSTed verbatim to the selected worker's `/execute`
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_id: Uuid,
    pub subtask: SubTask,
    /// Map of dependency subtask id to that dependency's output blob.
    /// Empty object for root subtasks.
    #[serde(default)]
    pub upstream_context: serde_json::Value,
}

impl WorkItem {
    /// A work item with no upstream context (root subtask).
    pub fn root(task_id: Uuid, subtask: SubTask) -> Self {
        Self {
            task_id,
            subtask,
            upstream_context: serde_json::json!({}),
        }
    }
}

/// A worker's status hash, owned by the worker and refreshed on heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subtask_id: Option<String>,
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub mem_pct: f64,
    #[serde(default)]
    pub completed_count: i64,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl WorkerStatus {
    /// Whether this worker advertises a given capability.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// The coordination store: work/result queues, worker hashes with TTL,
/// per-task queued-subtask sets, and shared state.
#[async_trait]
pub trait CoordStore: Send + Sync {
    // -- work queue --

    /// Append an item to the tail of the work queue.
    async fn push_work(&self, item: String) -> Result<(), CoordError>;

    /// Pop the head of the work queue, blocking up to `timeout`.
    ///
    /// Atomic handoff: an item is delivered to exactly one caller. A caller
    /// that fails to process the item must push it back explicitly.
    async fn pop_work(&self, timeout: Duration) -> Result<Option<String>, CoordError>;

    /// Current work queue depth (operator backpressure signal).
    async fn work_queue_len(&self) -> Result<usize, CoordError>;

    // -- result queue --

    /// Append a result message to the tail of the result queue.
    async fn push_result(&self, item: String) -> Result<(), CoordError>;

    /// Pop the head of the result queue, blocking up to `timeout`.
    async fn pop_result(&self, timeout: Duration) -> Result<Option<String>, CoordError>;

    /// Current result queue depth.
    async fn result_queue_len(&self) -> Result<usize, CoordError>;

    // -- worker registry --

    /// Write a worker's status hash and (re)arm its TTL.
    async fn put_worker(&self, status: &WorkerStatus, ttl: Duration) -> Result<(), CoordError>;

    /// Read one worker's status. Returns `None` for unknown or TTL-expired
    /// workers.
    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerStatus>, CoordError>;

    /// All workers whose TTL has not expired. Expired workers are never
    /// returned.
    async fn live_workers(&self) -> Result<Vec<WorkerStatus>, CoordError>;

    /// Flip a worker's availability without touching its TTL.
    ///
    /// Best-effort write from the orchestrator side; the worker's own
    /// heartbeat remains authoritative. Returns `false` when the worker is
    /// unknown or expired.
    async fn set_worker_availability(
        &self,
        worker_id: &str,
        available: bool,
        current_subtask_id: Option<String>,
    ) -> Result<bool, CoordError>;

    // -- per-task queued set --

    /// Record that a subtask has been enqueued for a task.
    ///
    /// Returns `false` when the subtask was already marked, which is how
    /// at-least-once result deliveries are kept from double-enqueueing a
    /// successor.
    async fn mark_queued(&self, task_id: Uuid, subtask_id: &str) -> Result<bool, CoordError>;

    /// Remove a queued mark (manual retry path).
    async fn unmark_queued(&self, task_id: Uuid, subtask_id: &str) -> Result<(), CoordError>;

    /// The set of subtask ids ever enqueued for a task.
    async fn queued_subtasks(&self, task_id: Uuid) -> Result<HashSet<String>, CoordError>;

    // -- shared state --

    /// Set an opaque state value, optionally expiring after `ttl`.
    async fn set_state(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError>;

    /// Get an opaque state value. Returns `None` for missing or expired keys.
    async fn get_state(&self, key: &str) -> Result<Option<String>, CoordError>;
}
