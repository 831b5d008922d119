//! Database query functions for the `tasks` table.
//!
//! The task row is exclusively owned by the orchestrator; workers never
//! touch it. State changes go through optimistic-locking UPDATEs whose
//! WHERE clause pins the expected current state, so concurrent result
//! processors cannot clobber each other's transitions.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{SubTask, Task, TaskState};

/// Insert a new task row in `pending` state.
///
/// The caller mints the id (UUIDv7, so ids sort chronologically).
pub async fn insert_task(
    pool: &PgPool,
    id: Uuid,
    submitter_id: &str,
    description: &str,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, submitter_id, description) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(id)
    .bind(submitter_id)
    .bind(description)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch only the state column for a task. Cheaper than [`get_task`] for
/// hot-path checks (e.g. the dispatcher's cancellation guard).
pub async fn get_task_state(pool: &PgPool, id: Uuid) -> Result<Option<TaskState>> {
    let state: Option<(TaskState,)> = sqlx::query_as("SELECT state FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task state")?;

    Ok(state.map(|(s,)| s))
}

/// List tasks ordered by creation time, newest first.
pub async fn list_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(pool)
            .await
            .context("failed to list tasks")?;

    Ok(tasks)
}

/// Replace the subtasks blob on a task (set once by the decomposer).
pub async fn set_subtasks(pool: &PgPool, id: Uuid, subtasks: &[SubTask]) -> Result<u64> {
    let blob = serde_json::to_value(subtasks).context("failed to serialize subtasks")?;

    let result = sqlx::query(
        "UPDATE tasks SET subtasks = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(blob)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set subtasks")?;

    Ok(result.rows_affected())
}

/// Atomically transition a task from one state to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `state = $from`, so the row is only updated if the current state matches
/// the expected value. Returns the number of rows affected (0 means the
/// state did not match or the task does not exist).
pub async fn transition_task_state(
    pool: &PgPool,
    id: Uuid,
    from: TaskState,
    to: TaskState,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = $1, updated_at = NOW() \
         WHERE id = $2 AND state = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task state")?;

    Ok(result.rows_affected())
}

/// Atomically transition `running -> failed`, recording the error message.
pub async fn fail_task(pool: &PgPool, id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'failed', error = $1, updated_at = NOW() \
         WHERE id = $2 AND state = 'running'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Atomically transition `running -> completed`, recording the aggregate.
pub async fn complete_task(
    pool: &PgPool,
    id: Uuid,
    aggregate_result: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'completed', aggregate_result = $1, updated_at = NOW() \
         WHERE id = $2 AND state = 'running'",
    )
    .bind(aggregate_result)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task completed")?;

    Ok(result.rows_affected())
}

/// Cancel a task. Only `pending` and `running` tasks can be cancelled.
pub async fn cancel_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'cancelled', updated_at = NOW() \
         WHERE id = $1 AND state IN ('pending', 'running')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected())
}

/// Reset a failed task back to `running` and clear its error.
///
/// This is the manual retry path; the caller is responsible for superseding
/// the failed result rows and re-enqueueing the failed subtasks.
pub async fn retry_task_to_running(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = 'running', error = NULL, updated_at = NOW() \
         WHERE id = $1 AND state = 'failed'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to retry task to running")?;

    Ok(result.rows_affected())
}

/// Task counts by state.
#[derive(Debug, Clone, Default)]
pub struct TaskCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of task counts by state.
pub async fn get_task_counts(pool: &PgPool) -> Result<TaskCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state::text, COUNT(*) as cnt FROM tasks GROUP BY state",
    )
    .fetch_all(pool)
    .await
    .context("failed to get task counts")?;

    let mut counts = TaskCounts::default();
    for (state, count) in &rows {
        match state.as_str() {
            "pending" => counts.pending = *count,
            "running" => counts.running = *count,
            "completed" => counts.completed = *count,
            "failed" => counts.failed = *count,
            "cancelled" => counts.cancelled = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
