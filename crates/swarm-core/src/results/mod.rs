//! Result processor: durably records each subtask outcome, advances the
//! DAG, and detects task completion or failure.
//!
//! Runs until cancellation. The result queue is at-least-once, so every
//! step here is idempotent: ingestion dedups on `(task_id, subtask_id)`,
//! successor enqueues dedup through the coordination store's queued set,
//! and terminal state transitions use optimistic locking so concurrent
//! processors cannot double-fire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use swarm_db::models::{LogLevel, NewSubTaskResult, Outcome, SubTask, SubTaskResult, Task};
use swarm_db::queries::{subtask_results, tasks};

use crate::activity;
use crate::config::SwarmConfig;
use crate::coord::{CoordStore, WorkItem};
use crate::registry::Registry;

/// Pause after a store error before retrying.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The result-processing loop. Construct one per configured instance and
/// call [`ResultProcessor::run`] on its own tokio task.
pub struct ResultProcessor {
    pool: PgPool,
    coord: Arc<dyn CoordStore>,
    registry: Arc<Registry>,
    config: SwarmConfig,
}

impl ResultProcessor {
    pub fn new(
        pool: PgPool,
        coord: Arc<dyn CoordStore>,
        registry: Arc<Registry>,
        config: SwarmConfig,
    ) -> Self {
        Self {
            pool,
            coord,
            registry,
            config,
        }
    }

    /// Run until the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                tracing::info!("result processor shutting down");
                return;
            }

            let popped = tokio::select! {
                popped = self.coord.pop_result(self.config.dequeue_timeout()) => popped,
                _ = cancel.cancelled() => continue,
            };

            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "result queue unavailable, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(STORE_RETRY_DELAY) => {}
                        _ = cancel.cancelled() => {}
                    }
                    continue;
                }
            };

            let result: NewSubTaskResult = match serde_json::from_str(&raw) {
                Ok(result) => result,
                Err(e) => {
                    // Poison message: drop, never re-enqueue.
                    tracing::error!(error = %e, "dropping unparsable result message");
                    continue;
                }
            };

            if let Err(e) = self.process(&result).await {
                // Store trouble mid-processing: push the raw message back so
                // it is redelivered once the store recovers. Idempotent
                // ingestion makes the redelivery safe.
                tracing::error!(
                    task_id = %result.task_id,
                    subtask_id = %result.subtask_id,
                    error = %e,
                    "failed to process result, re-enqueueing message"
                );
                if let Err(push_err) = self.coord.push_result(raw).await {
                    tracing::error!(error = %push_err, "failed to re-enqueue result message");
                }
                tokio::select! {
                    _ = tokio::time::sleep(STORE_RETRY_DELAY) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    /// Handle one result message end to end.
    pub async fn process(&self, result: &NewSubTaskResult) -> Result<()> {
        // A well-formed message for a task that does not exist is dropped
        // here; inserting it would trip the foreign key and the message
        // would bounce forever.
        let Some(task) = tasks::get_task(&self.pool, result.task_id).await? else {
            tracing::warn!(
                task_id = %result.task_id,
                subtask_id = %result.subtask_id,
                "result references unknown task, dropping"
            );
            return Ok(());
        };

        let inserted = subtask_results::insert_result(&self.pool, result).await?;
        if inserted {
            tracing::info!(
                task_id = %result.task_id,
                subtask_id = %result.subtask_id,
                worker_id = %result.worker_id,
                outcome = %result.outcome,
                "subtask result recorded"
            );
            activity::record(
                &self.pool,
                &result.worker_id,
                Some(result.task_id),
                match result.outcome {
                    Outcome::Completed => LogLevel::Info,
                    Outcome::Failed => LogLevel::Warn,
                },
                format!(
                    "subtask {} reported {} by worker {}",
                    result.subtask_id, result.outcome, result.worker_id
                ),
                result.error.clone().map(|e| serde_json::json!({"error": e})),
            )
            .await;
        } else {
            tracing::debug!(
                task_id = %result.task_id,
                subtask_id = %result.subtask_id,
                "duplicate result delivery ignored"
            );
        }

        // Best-effort: free up the reporting worker. Its own heartbeat is
        // authoritative either way.
        let _ = self.registry.mark_available(&result.worker_id).await;

        if task.state.is_terminal() {
            // Late result for a completed/failed/cancelled task: the row is
            // persisted for the record, but the DAG does not move.
            return Ok(());
        }

        self.advance(&task).await
    }

    /// Advance the DAG for a task given the full set of persisted results.
    async fn advance(&self, task: &Task) -> Result<()> {
        let results = subtask_results::list_results_for_task(&self.pool, task.id).await?;

        let completed: HashMap<&str, &SubTaskResult> = results
            .iter()
            .filter(|r| r.outcome == Outcome::Completed)
            .map(|r| (r.subtask_id.as_str(), r))
            .collect();
        let first_failed = results.iter().find(|r| r.outcome == Outcome::Failed);

        // Any failure fails the whole task: the unexecuted remainder of the
        // plan (failed subtask successors included) never runs.
        if let Some(failed) = first_failed {
            let error = format!(
                "subtask {} failed: {}",
                failed.subtask_id,
                failed.error.as_deref().unwrap_or("unknown error")
            );
            let rows = tasks::fail_task(&self.pool, task.id, &error).await?;
            if rows > 0 {
                tracing::warn!(task_id = %task.id, error = %error, "task failed");
                activity::record(
                    &self.pool,
                    activity::ORCHESTRATOR_ID,
                    Some(task.id),
                    LogLevel::Error,
                    format!("task failed: {error}"),
                    Some(serde_json::json!({"failed_subtask_id": failed.subtask_id})),
                )
                .await;
            }
            return Ok(());
        }

        let subtasks = &task.subtasks.0;

        if completed.len() == subtasks.len() {
            let aggregate = build_aggregate(subtasks, &completed);
            let rows = tasks::complete_task(&self.pool, task.id, &aggregate).await?;
            if rows > 0 {
                tracing::info!(
                    task_id = %task.id,
                    subtasks = subtasks.len(),
                    "task completed"
                );
                activity::record(
                    &self.pool,
                    activity::ORCHESTRATOR_ID,
                    Some(task.id),
                    LogLevel::Info,
                    format!("task completed with {} subtask results", subtasks.len()),
                    None,
                )
                .await;
            }
            return Ok(());
        }

        // Still in progress: enqueue every subtask whose dependencies are
        // now all completed and which has not been enqueued before.
        for subtask in subtasks {
            if completed.contains_key(subtask.id.as_str()) {
                continue;
            }
            if !subtask
                .dependencies
                .iter()
                .all(|dep| completed.contains_key(dep.as_str()))
            {
                continue;
            }

            // The queued mark covers running and previously-enqueued
            // subtasks, and dedups across at-least-once deliveries.
            if !self
                .coord
                .mark_queued(task.id, &subtask.id)
                .await
                .context("failed to mark subtask queued")?
            {
                continue;
            }

            let item = WorkItem {
                task_id: task.id,
                subtask: subtask.clone(),
                upstream_context: upstream_context(subtask, &completed),
            };
            let raw = serde_json::to_string(&item).context("failed to serialize work item")?;
            if let Err(e) = self.coord.push_work(raw).await {
                // Roll the mark back so a redelivery can enqueue it.
                let _ = self.coord.unmark_queued(task.id, &subtask.id).await;
                return Err(e).context("failed to enqueue ready subtask");
            }

            tracing::info!(
                task_id = %task.id,
                subtask_id = %subtask.id,
                "dependencies satisfied, subtask enqueued"
            );
        }

        Ok(())
    }
}

/// Bundle the outputs of a subtask's direct dependencies for its dispatch
/// payload.
pub(crate) fn upstream_context(
    subtask: &SubTask,
    completed: &HashMap<&str, &SubTaskResult>,
) -> serde_json::Value {
    let mut context = serde_json::Map::new();
    for dep in &subtask.dependencies {
        let output = completed
            .get(dep.as_str())
            .and_then(|r| r.output.clone())
            .unwrap_or(serde_json::Value::Null);
        context.insert(dep.clone(), output);
    }
    serde_json::Value::Object(context)
}

/// Build the aggregate blob for a fully-completed task. Entries follow the
/// subtask declaration order.
fn build_aggregate(
    subtasks: &[SubTask],
    completed: &HashMap<&str, &SubTaskResult>,
) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = subtasks
        .iter()
        .filter_map(|s| completed.get(s.id.as_str()))
        .map(|r| {
            serde_json::json!({
                "subtask_id": r.subtask_id,
                "worker_id": r.worker_id,
                "output": r.output,
                "execution_time_seconds": r.execution_time_seconds,
                "created_at": r.created_at,
            })
        })
        .collect();

    serde_json::json!({
        "subtask_results": entries,
        "summary": "all completed",
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use swarm_db::models::Capability;

    fn subtask(id: &str, deps: &[&str]) -> SubTask {
        SubTask {
            id: id.to_string(),
            description: format!("subtask {id} does something"),
            required_capabilities: vec![Capability::DataAnalysis],
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: 5,
            estimated_duration_seconds: None,
            input_data: serde_json::json!({}),
        }
    }

    fn completed_result(subtask_id: &str, output: serde_json::Value) -> SubTaskResult {
        SubTaskResult {
            id: 1,
            task_id: Uuid::new_v4(),
            subtask_id: subtask_id.to_string(),
            worker_id: "worker-a".to_string(),
            outcome: Outcome::Completed,
            output: Some(output),
            error: None,
            execution_time_seconds: 1.5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upstream_context_collects_dependency_outputs() {
        let st = subtask("c", &["a", "b"]);
        let ra = completed_result("a", serde_json::json!({"rows": 10}));
        let rb = completed_result("b", serde_json::json!({"rows": 20}));
        let completed: HashMap<&str, &SubTaskResult> =
            [("a", &ra), ("b", &rb)].into_iter().collect();

        let context = upstream_context(&st, &completed);
        assert_eq!(context["a"]["rows"], 10);
        assert_eq!(context["b"]["rows"], 20);
    }

    #[test]
    fn upstream_context_is_empty_for_roots() {
        let st = subtask("root", &[]);
        let completed = HashMap::new();
        let context = upstream_context(&st, &completed);
        assert_eq!(context, serde_json::json!({}));
    }

    #[test]
    fn aggregate_follows_declaration_order() {
        let subtasks = vec![subtask("a", &[]), subtask("b", &["a"])];
        let ra = completed_result("a", serde_json::json!({"step": 1}));
        let rb = completed_result("b", serde_json::json!({"step": 2}));
        // Insert in reverse to prove order comes from the subtask list.
        let completed: HashMap<&str, &SubTaskResult> =
            [("b", &rb), ("a", &ra)].into_iter().collect();

        let aggregate = build_aggregate(&subtasks, &completed);
        assert_eq!(aggregate["summary"], "all completed");
        let entries = aggregate["subtask_results"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["subtask_id"], "a");
        assert_eq!(entries[1]["subtask_id"], "b");
        assert!(entries[0]["execution_time_seconds"].as_f64().unwrap() > 0.0);
    }
}
