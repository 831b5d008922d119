//! Dispatcher: drains the work queue and binds each subtask to a live,
//! available worker that matches its required capabilities.
//!
//! Runs until cancellation. Several dispatcher instances may run
//! concurrently; the queue's atomic handoff guarantees each item reaches
//! exactly one of them. Unassignable work is pushed back to the tail with
//! exponential backoff, never dropped -- operators watch queue depth for
//! persistent starvation.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use swarm_db::models::{LogLevel, TaskState};
use swarm_db::queries::tasks;

use crate::activity;
use crate::config::SwarmConfig;
use crate::coord::{CoordStore, WorkItem};
use crate::registry::Registry;
use crate::worker_client::{DispatchOutcome, WorkerClient, WorkerClientError};

/// Backoff bounds for the no-candidate and dispatch-failure paths.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Pause after a store error before retrying.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What became of one dequeued item.
enum Disposition {
    /// Handed to a worker.
    Dispatched,
    /// Pushed back to the tail; caller should back off.
    Requeued,
    /// Dropped on purpose (cancelled task, poison payload).
    Dropped,
}

/// The dispatch loop. Construct one per configured instance and call
/// [`Dispatcher::run`] on its own tokio task.
pub struct Dispatcher {
    pool: PgPool,
    coord: Arc<dyn CoordStore>,
    registry: Arc<Registry>,
    client: WorkerClient,
    config: SwarmConfig,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        coord: Arc<dyn CoordStore>,
        registry: Arc<Registry>,
        client: WorkerClient,
        config: SwarmConfig,
    ) -> Self {
        Self {
            pool,
            coord,
            registry,
            client,
            config,
        }
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = BACKOFF_BASE;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("dispatcher shutting down");
                return;
            }

            let popped = tokio::select! {
                popped = self.coord.pop_work(self.config.dequeue_timeout()) => popped,
                _ = cancel.cancelled() => continue,
            };

            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "work queue unavailable, retrying");
                    sleep_or_cancel(STORE_RETRY_DELAY, &cancel).await;
                    continue;
                }
            };

            let item: WorkItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    // Poison message: drop, never re-enqueue.
                    tracing::error!(error = %e, "dropping unparsable work item");
                    continue;
                }
            };

            match self.dispatch_one(&item, &cancel).await {
                Disposition::Dispatched | Disposition::Dropped => {
                    backoff = BACKOFF_BASE;
                }
                Disposition::Requeued => {
                    sleep_or_cancel(backoff, &cancel).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Try to place one work item on a worker.
    async fn dispatch_one(&self, item: &WorkItem, cancel: &CancellationToken) -> Disposition {
        let subtask_id = item.subtask.id.as_str();

        // Cancellation guard: a cancelled task gets no further dispatches.
        match tasks::get_task_state(&self.pool, item.task_id).await {
            Ok(Some(TaskState::Cancelled)) => {
                tracing::info!(
                    task_id = %item.task_id,
                    subtask_id,
                    "task cancelled, dropping queued subtask"
                );
                return Disposition::Dropped;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    task_id = %item.task_id,
                    subtask_id,
                    "work item references unknown task, dropping"
                );
                return Disposition::Dropped;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to check task state before dispatch");
                self.requeue(item, cancel).await;
                return Disposition::Requeued;
            }
        }

        let candidates = match self
            .registry
            .available_for(&item.subtask.required_capabilities, self.config.selection_policy)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, "worker lookup failed");
                self.requeue(item, cancel).await;
                return Disposition::Requeued;
            }
        };

        if candidates.is_empty() {
            tracing::debug!(
                task_id = %item.task_id,
                subtask_id,
                required = ?item.subtask.required_capabilities,
                "no matching worker available, re-enqueueing"
            );
            self.requeue(item, cancel).await;
            return Disposition::Requeued;
        }

        // Uniform random pick so overlapping capability sets spread load
        // instead of hammering the first match.
        let chosen = {
            use rand::Rng;
            let idx = rand::rng().random_range(0..candidates.len());
            candidates[idx].clone()
        };

        match self.client.execute(&chosen.endpoint, item).await {
            Ok(DispatchOutcome::Accepted { worker_id }) => {
                // Best-effort; the worker self-reports busy on its next
                // heartbeat regardless.
                let _ = self.registry.mark_busy(&worker_id, subtask_id).await;

                tracing::info!(
                    task_id = %item.task_id,
                    subtask_id,
                    worker_id = %worker_id,
                    "subtask dispatched"
                );
                activity::record(
                    &self.pool,
                    activity::ORCHESTRATOR_ID,
                    Some(item.task_id),
                    LogLevel::Info,
                    format!("dispatched subtask {subtask_id} to worker {worker_id}"),
                    Some(serde_json::json!({
                        "subtask_id": subtask_id,
                        "worker_id": worker_id,
                    })),
                )
                .await;
                Disposition::Dispatched
            }
            Ok(DispatchOutcome::Busy) => {
                tracing::warn!(
                    task_id = %item.task_id,
                    subtask_id,
                    worker_id = %chosen.id,
                    "worker busy, re-enqueueing subtask"
                );
                self.requeue(item, cancel).await;
                Disposition::Requeued
            }
            Err(e) => {
                let kind = match &e {
                    WorkerClientError::Transport(_) => "transport",
                    WorkerClientError::UnexpectedStatus(_) => "status",
                    WorkerClientError::BadResponse(_) => "response",
                };
                tracing::warn!(
                    task_id = %item.task_id,
                    subtask_id,
                    worker_id = %chosen.id,
                    error = %e,
                    kind,
                    "dispatch to worker failed, re-enqueueing subtask"
                );
                self.requeue(item, cancel).await;
                Disposition::Requeued
            }
        }
    }

    /// Push an item back to the queue tail, retrying until it lands or the
    /// loop is cancelled. Work is never dropped on a store hiccup.
    async fn requeue(&self, item: &WorkItem, cancel: &CancellationToken) {
        let raw = match serde_json::to_string(item) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize work item for re-enqueue");
                return;
            }
        };

        loop {
            match self.coord.push_work(raw.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(error = %e, "re-enqueue failed, retrying");
                    sleep_or_cancel(STORE_RETRY_DELAY, cancel).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }
}

/// Sleep for `duration` unless cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}
