//! Best-effort activity logging into the durable store.
//!
//! Operational events are mirrored to `activity_logs` so operators can
//! audit a task's history. Logging must never fail the operation that
//! produced the event, so failures are downgraded to tracing warnings.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use swarm_db::models::LogLevel;
use swarm_db::queries::activity_logs::{self, NewActivityLog};

/// Worker id used for entries written by the orchestrator itself.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Append an activity log entry, swallowing store errors.
pub async fn record(
    pool: &PgPool,
    worker_id: &str,
    task_id: Option<Uuid>,
    level: LogLevel,
    message: impl Into<String>,
    metadata: Option<Value>,
) {
    let new = NewActivityLog {
        worker_id: worker_id.to_string(),
        task_id,
        level,
        message: message.into(),
        metadata,
    };

    if let Err(e) = activity_logs::insert_activity_log(pool, &new).await {
        tracing::warn!(error = %e, "failed to append activity log entry");
    }
}
