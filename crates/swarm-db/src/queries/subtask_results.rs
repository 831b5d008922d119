//! Database query functions for the `subtask_results` table.
//!
//! Ingestion is idempotent: the table carries a uniqueness constraint on
//! `(task_id, subtask_id)` and inserts use `ON CONFLICT DO NOTHING`, so an
//! at-least-once result queue cannot produce duplicate rows.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{NewSubTaskResult, SubTaskResult};

/// Insert a result row if none exists for `(task_id, subtask_id)`.
///
/// Returns `true` when a row was inserted, `false` when the result was a
/// duplicate delivery and the insert was a no-op.
pub async fn insert_result(pool: &PgPool, new: &NewSubTaskResult) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO subtask_results \
         (task_id, subtask_id, worker_id, outcome, output, error, execution_time_seconds, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, NOW())) \
         ON CONFLICT (task_id, subtask_id) DO NOTHING",
    )
    .bind(new.task_id)
    .bind(&new.subtask_id)
    .bind(&new.worker_id)
    .bind(new.outcome)
    .bind(&new.output)
    .bind(&new.error)
    .bind(new.execution_time_seconds)
    .bind(new.created_at)
    .execute(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert result for task {} subtask {}",
            new.task_id, new.subtask_id
        )
    })?;

    Ok(result.rows_affected() > 0)
}

/// Get all results for a task, oldest first.
pub async fn list_results_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<SubTaskResult>> {
    let results = sqlx::query_as::<_, SubTaskResult>(
        "SELECT * FROM subtask_results \
         WHERE task_id = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list subtask results")?;

    Ok(results)
}

/// Get the result for one subtask, if any.
pub async fn get_result(
    pool: &PgPool,
    task_id: Uuid,
    subtask_id: &str,
) -> Result<Option<SubTaskResult>> {
    let result = sqlx::query_as::<_, SubTaskResult>(
        "SELECT * FROM subtask_results WHERE task_id = $1 AND subtask_id = $2",
    )
    .bind(task_id)
    .bind(subtask_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch subtask result")?;

    Ok(result)
}

/// Delete the failed result rows for a task, returning them.
///
/// Used by the manual retry path: deleting the failed rows lets the retried
/// subtasks re-ingest cleanly through the uniqueness constraint. The audit
/// trail survives in `activity_logs`.
pub async fn delete_failed_results(pool: &PgPool, task_id: Uuid) -> Result<Vec<SubTaskResult>> {
    let deleted = sqlx::query_as::<_, SubTaskResult>(
        "DELETE FROM subtask_results \
         WHERE task_id = $1 AND outcome = 'failed' \
         RETURNING *",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to delete failed subtask results")?;

    Ok(deleted)
}

/// Count the results recorded for a task.
pub async fn count_results(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subtask_results WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to count subtask results")?;

    Ok(row.0)
}
