//! `swarm status`: print task state from the durable store.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use swarm_db::queries::{subtask_results, tasks};

/// Show one task in detail, or the most recent tasks when no id is given.
pub async fn run_status(pool: &PgPool, task_id: Option<Uuid>) -> Result<()> {
    match task_id {
        Some(id) => show_task(pool, id).await,
        None => list_tasks(pool).await,
    }
}

async fn show_task(pool: &PgPool, id: Uuid) -> Result<()> {
    let Some(task) = tasks::get_task(pool, id).await? else {
        anyhow::bail!("task {id} not found");
    };

    println!("Task {}", task.id);
    println!("  submitter:  {}", task.submitter_id);
    println!("  state:      {}", task.state);
    println!("  created_at: {}", task.created_at.to_rfc3339());
    println!("  updated_at: {}", task.updated_at.to_rfc3339());
    if let Some(error) = &task.error {
        println!("  error:      {error}");
    }

    let results = subtask_results::list_results_for_task(pool, id).await?;
    let resulted: std::collections::HashSet<&str> =
        results.iter().map(|r| r.subtask_id.as_str()).collect();

    println!("  subtasks ({}):", task.subtasks.0.len());
    for subtask in &task.subtasks.0 {
        let marker = if resulted.contains(subtask.id.as_str()) {
            "done"
        } else {
            "open"
        };
        let caps: Vec<String> = subtask
            .required_capabilities
            .iter()
            .map(|c| c.to_string())
            .collect();
        println!(
            "    [{marker}] {} p{} [{}] {}",
            subtask.id,
            subtask.priority,
            caps.join(", "),
            subtask.description
        );
    }

    if !results.is_empty() {
        println!("  results:");
        for result in &results {
            println!(
                "    {} -> {} by {} in {:.2}s",
                result.subtask_id, result.outcome, result.worker_id, result.execution_time_seconds
            );
            if let Some(error) = &result.error {
                println!("      error: {error}");
            }
        }
    }

    if let Some(aggregate) = &task.aggregate_result {
        println!("  aggregate_result:");
        println!("{}", serde_json::to_string_pretty(aggregate)?);
    }

    Ok(())
}

async fn list_tasks(pool: &PgPool) -> Result<()> {
    let counts = tasks::get_task_counts(pool).await?;
    println!(
        "{} tasks: {} pending, {} running, {} completed, {} failed, {} cancelled",
        counts.total,
        counts.pending,
        counts.running,
        counts.completed,
        counts.failed,
        counts.cancelled
    );

    let recent = tasks::list_tasks(pool, 50).await?;
    if recent.is_empty() {
        return Ok(());
    }

    println!();
    for task in &recent {
        let description: String = task.description.chars().take(60).collect();
        println!(
            "{}  {:9}  {}  {}",
            task.id,
            task.state.to_string(),
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            description
        );
    }

    Ok(())
}
