//! Database query functions for the append-only `activity_logs` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ActivityLog, LogLevel};

/// Parameters for inserting a new activity log row.
#[derive(Debug, Clone)]
pub struct NewActivityLog {
    pub worker_id: String,
    pub task_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Insert a new activity log row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_activity_log(pool: &PgPool, new: &NewActivityLog) -> Result<ActivityLog> {
    let log = sqlx::query_as::<_, ActivityLog>(
        "INSERT INTO activity_logs (worker_id, task_id, level, message, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.worker_id)
    .bind(new.task_id)
    .bind(new.level)
    .bind(&new.message)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert activity log from worker {} level {}",
            new.worker_id, new.level
        )
    })?;

    Ok(log)
}

/// Get all activity logs for a task, oldest first.
pub async fn list_logs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<ActivityLog>> {
    let logs = sqlx::query_as::<_, ActivityLog>(
        "SELECT * FROM activity_logs \
         WHERE task_id = $1 \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list activity logs for task")?;

    Ok(logs)
}

/// Get the most recent activity logs across all tasks, newest first.
pub async fn list_recent_logs(pool: &PgPool, limit: i64) -> Result<Vec<ActivityLog>> {
    let logs = sqlx::query_as::<_, ActivityLog>(
        "SELECT * FROM activity_logs ORDER BY created_at DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent activity logs")?;

    Ok(logs)
}
