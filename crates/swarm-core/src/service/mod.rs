//! Task service layer: the operations behind the public API surface.
//!
//! Owns submission (validate, persist, decompose, enqueue the initial ready
//! set), status reads, cancellation, and the manual retry path. Everything
//! is constructor-injected; there is no process-wide state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use swarm_db::models::{
    Capability, LogLevel, Outcome, SubTaskResult, Task, TaskState,
};
use swarm_db::queries::{subtask_results, tasks};

use crate::activity;
use crate::config::SwarmConfig;
use crate::coord::{CoordStore, WorkItem, WorkerStatus};
use crate::decompose::{self, Decomposer};
use crate::registry::Registry;
use crate::results::upstream_context;

/// Task description bounds, enforced at the API boundary.
pub const MIN_DESCRIPTION: usize = 10;
pub const MAX_DESCRIPTION: usize = 5000;

/// Errors surfaced by the service. The HTTP layer maps these onto status
/// codes; store failures stay wrapped in `Internal`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(
        "description must be between {MIN_DESCRIPTION} and {MAX_DESCRIPTION} characters, got {0}"
    )]
    InvalidDescription(usize),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {task_id} is {state}, expected {expected}")]
    InvalidState {
        task_id: Uuid,
        state: TaskState,
        expected: &'static str,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub task_id: Uuid,
    pub subtasks_count: usize,
    pub initial_subtasks_queued: usize,
}

/// A task with its recorded subtask results.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub subtask_results: Vec<SubTaskResult>,
}

/// Result of a manual retry.
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub task_id: Uuid,
    pub requeued_subtasks: usize,
}

/// The task service handle. Cheap to share behind an `Arc`.
pub struct TaskService {
    pool: PgPool,
    coord: Arc<dyn CoordStore>,
    registry: Arc<Registry>,
    decomposer: Decomposer,
    config: SwarmConfig,
}

impl TaskService {
    pub fn new(
        pool: PgPool,
        coord: Arc<dyn CoordStore>,
        registry: Arc<Registry>,
        decomposer: Decomposer,
        config: SwarmConfig,
    ) -> Self {
        Self {
            pool,
            coord,
            registry,
            decomposer,
            config,
        }
    }

    /// Submit a task: validate, persist, decompose, enqueue the initial
    /// ready set, and move the task to `running`.
    pub async fn submit(
        &self,
        description: &str,
        submitter_id: Option<&str>,
    ) -> Result<SubmitOutcome, ServiceError> {
        let len = description.chars().count();
        if !(MIN_DESCRIPTION..=MAX_DESCRIPTION).contains(&len) {
            return Err(ServiceError::InvalidDescription(len));
        }

        let task_id = Uuid::now_v7();
        let submitter = submitter_id.unwrap_or("anonymous");
        tasks::insert_task(&self.pool, task_id, submitter, description).await?;

        let decomposition = self.decomposer.decompose(description).await;
        tasks::set_subtasks(&self.pool, task_id, &decomposition.subtasks).await?;

        if decomposition.used_fallback {
            activity::record(
                &self.pool,
                activity::ORCHESTRATOR_ID,
                Some(task_id),
                LogLevel::Warn,
                "planner output unusable, decomposed to single-subtask fallback",
                None,
            )
            .await;
        }

        let ready = decompose::initial_ready_set(&decomposition.subtasks);

        // Move to running before the first enqueue: a fast worker could
        // otherwise report a result while the row still says pending, and
        // the completion transition (optimistic on running) would no-op.
        if !ready.is_empty() {
            tasks::transition_task_state(&self.pool, task_id, TaskState::Pending, TaskState::Running)
                .await?;
        }

        let mut queued = 0usize;
        for subtask in &ready {
            if !self
                .coord
                .mark_queued(task_id, &subtask.id)
                .await
                .context("failed to mark subtask queued")?
            {
                continue;
            }
            let item = WorkItem::root(task_id, subtask.clone());
            let raw = serde_json::to_string(&item).context("failed to serialize work item")?;
            self.coord
                .push_work(raw)
                .await
                .context("failed to enqueue initial subtask")?;
            queued += 1;
        }

        tracing::info!(
            task_id = %task_id,
            subtasks = decomposition.subtasks.len(),
            queued,
            fallback = decomposition.used_fallback,
            "task submitted"
        );
        activity::record(
            &self.pool,
            activity::ORCHESTRATOR_ID,
            Some(task_id),
            LogLevel::Info,
            format!(
                "task submitted with {} subtasks, {} queued",
                decomposition.subtasks.len(),
                queued
            ),
            Some(serde_json::json!({"submitter_id": submitter})),
        )
        .await;

        Ok(SubmitOutcome {
            task_id,
            subtasks_count: decomposition.subtasks.len(),
            initial_subtasks_queued: queued,
        })
    }

    /// Fetch a task and its recorded results.
    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskDetail, ServiceError> {
        let task = tasks::get_task(&self.pool, task_id)
            .await?
            .ok_or(ServiceError::TaskNotFound(task_id))?;
        let results = subtask_results::list_results_for_task(&self.pool, task_id).await?;
        Ok(TaskDetail {
            task,
            subtask_results: results,
        })
    }

    /// Cancel a pending or running task.
    ///
    /// Stops future enqueues only: subtasks already at a worker run to
    /// completion and their results are still recorded.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, ServiceError> {
        let rows = tasks::cancel_task(&self.pool, task_id).await?;
        if rows == 0 {
            let task = tasks::get_task(&self.pool, task_id)
                .await?
                .ok_or(ServiceError::TaskNotFound(task_id))?;
            return Err(ServiceError::InvalidState {
                task_id,
                state: task.state,
                expected: "pending or running",
            });
        }

        tracing::info!(task_id = %task_id, "task cancelled");
        activity::record(
            &self.pool,
            activity::ORCHESTRATOR_ID,
            Some(task_id),
            LogLevel::Info,
            "task cancelled by operator",
            None,
        )
        .await;

        let task = tasks::get_task(&self.pool, task_id)
            .await?
            .ok_or(ServiceError::TaskNotFound(task_id))?;
        Ok(task)
    }

    /// Manually retry a task.
    ///
    /// For a `failed` task: resets it to `running`, supersedes the failed
    /// result rows (they are deleted; the audit trail stays in the activity
    /// log), and re-enqueues exactly the failed subtasks. Successors become
    /// ready when those complete, as usual.
    ///
    /// For a `running` task: re-enqueues subtasks that were dispatched but
    /// never produced a result -- the recovery path for a worker that died
    /// holding work.
    pub async fn retry(&self, task_id: Uuid) -> Result<RetryOutcome, ServiceError> {
        let task = tasks::get_task(&self.pool, task_id)
            .await?
            .ok_or(ServiceError::TaskNotFound(task_id))?;

        match task.state {
            TaskState::Failed => self.retry_failed(task).await,
            TaskState::Running => self.retry_stuck(task).await,
            state => Err(ServiceError::InvalidState {
                task_id,
                state,
                expected: "failed or running",
            }),
        }
    }

    async fn retry_failed(&self, task: Task) -> Result<RetryOutcome, ServiceError> {
        let rows = tasks::retry_task_to_running(&self.pool, task.id).await?;
        if rows == 0 {
            // Lost a race with another retry; report the current state.
            let current = tasks::get_task(&self.pool, task.id)
                .await?
                .ok_or(ServiceError::TaskNotFound(task.id))?;
            return Err(ServiceError::InvalidState {
                task_id: task.id,
                state: current.state,
                expected: "failed",
            });
        }

        let superseded = subtask_results::delete_failed_results(&self.pool, task.id).await?;

        for old in &superseded {
            activity::record(
                &self.pool,
                activity::ORCHESTRATOR_ID,
                Some(task.id),
                LogLevel::Warn,
                format!(
                    "superseded failed result for subtask {} (worker {}, error: {})",
                    old.subtask_id,
                    old.worker_id,
                    old.error.as_deref().unwrap_or("unknown error")
                ),
                Some(serde_json::json!({
                    "subtask_id": old.subtask_id,
                    "worker_id": old.worker_id,
                })),
            )
            .await;
        }

        let remaining = subtask_results::list_results_for_task(&self.pool, task.id).await?;
        let completed: HashMap<&str, &SubTaskResult> = remaining
            .iter()
            .filter(|r| r.outcome == Outcome::Completed)
            .map(|r| (r.subtask_id.as_str(), r))
            .collect();

        let mut requeued = 0usize;
        for old in &superseded {
            let Some(subtask) = task.subtask(&old.subtask_id) else {
                tracing::warn!(
                    task_id = %task.id,
                    subtask_id = %old.subtask_id,
                    "superseded result references unknown subtask, skipping"
                );
                continue;
            };
            let item = WorkItem {
                task_id: task.id,
                subtask: subtask.clone(),
                upstream_context: upstream_context(subtask, &completed),
            };
            let raw = serde_json::to_string(&item).context("failed to serialize work item")?;
            self.coord
                .push_work(raw)
                .await
                .context("failed to re-enqueue retried subtask")?;
            requeued += 1;
        }

        tracing::info!(task_id = %task.id, requeued, "failed task reset to running");
        Ok(RetryOutcome {
            task_id: task.id,
            requeued_subtasks: requeued,
        })
    }

    async fn retry_stuck(&self, task: Task) -> Result<RetryOutcome, ServiceError> {
        let queued = self
            .coord
            .queued_subtasks(task.id)
            .await
            .context("failed to read queued subtask set")?;
        let results = subtask_results::list_results_for_task(&self.pool, task.id).await?;
        let resulted: HashSet<&str> = results.iter().map(|r| r.subtask_id.as_str()).collect();
        let completed: HashMap<&str, &SubTaskResult> = results
            .iter()
            .filter(|r| r.outcome == Outcome::Completed)
            .map(|r| (r.subtask_id.as_str(), r))
            .collect();

        let mut requeued = 0usize;
        for subtask in &task.subtasks.0 {
            if !queued.contains(&subtask.id) || resulted.contains(subtask.id.as_str()) {
                continue;
            }
            let item = WorkItem {
                task_id: task.id,
                subtask: subtask.clone(),
                upstream_context: upstream_context(subtask, &completed),
            };
            let raw = serde_json::to_string(&item).context("failed to serialize work item")?;
            self.coord
                .push_work(raw)
                .await
                .context("failed to re-enqueue stuck subtask")?;
            requeued += 1;

            tracing::info!(
                task_id = %task.id,
                subtask_id = %subtask.id,
                "re-enqueued in-flight subtask with no result"
            );
        }

        Ok(RetryOutcome {
            task_id: task.id,
            requeued_subtasks: requeued,
        })
    }

    /// Snapshot of all live workers.
    pub async fn list_workers(&self) -> Result<Vec<WorkerStatus>, ServiceError> {
        let workers = self.registry.snapshot().await.map_err(anyhow::Error::from)?;
        Ok(workers)
    }

    /// Ids of live, available workers, optionally filtered by capability.
    pub async fn list_available_workers(
        &self,
        capability: Option<Capability>,
    ) -> Result<Vec<String>, ServiceError> {
        let workers = match capability {
            Some(cap) => self
                .registry
                .available_for(&[cap], self.config.selection_policy)
                .await
                .map_err(anyhow::Error::from)?,
            None => self
                .registry
                .snapshot()
                .await
                .map_err(anyhow::Error::from)?
                .into_iter()
                .filter(|w| w.available)
                .collect(),
        };
        Ok(workers.into_iter().map(|w| w.id).collect())
    }

    /// Current queue depths (operator backpressure signal).
    pub async fn queue_depths(&self) -> Result<(usize, usize), ServiceError> {
        let work = self
            .coord
            .work_queue_len()
            .await
            .context("failed to read work queue depth")?;
        let result = self
            .coord
            .result_queue_len()
            .await
            .context("failed to read result queue depth")?;
        Ok((work, result))
    }
}
