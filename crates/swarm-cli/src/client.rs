//! Thin HTTP client commands against a running `swarm serve` instance.
//!
//! Submission, cancellation, retry, and worker listings go through the
//! server rather than straight to the stores: the work queue and worker
//! registry live in the serve process.

use anyhow::{bail, Context, Result};

/// Default server address for client commands.
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

async fn post_json(
    server: &str,
    path: &str,
    body: serde_json::Value,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let url = format!("{}{}", server.trim_end_matches('/'), path);
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;

    let status = response.status();
    let json: serde_json::Value = response
        .json()
        .await
        .context("server returned a non-JSON response")?;

    if !status.is_success() {
        let message = json["error"].as_str().unwrap_or("unknown error");
        bail!("server returned {status}: {message}");
    }
    Ok(json)
}

async fn get_json(server: &str, path: &str) -> Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let url = format!("{}{}", server.trim_end_matches('/'), path);
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach server at {url}"))?;

    let status = response.status();
    let json: serde_json::Value = response
        .json()
        .await
        .context("server returned a non-JSON response")?;

    if !status.is_success() {
        let message = json["error"].as_str().unwrap_or("unknown error");
        bail!("server returned {status}: {message}");
    }
    Ok(json)
}

/// Submit a task description.
pub async fn cmd_submit(server: &str, description: &str, submitter: Option<&str>) -> Result<()> {
    let mut body = serde_json::json!({"description": description});
    if let Some(submitter) = submitter {
        body["submitter_id"] = serde_json::json!(submitter);
    }

    let json = post_json(server, "/tasks", body).await?;
    println!("Task submitted: {}", json["task_id"].as_str().unwrap_or("?"));
    println!("  subtasks:       {}", json["subtasks_count"]);
    println!("  initially queued: {}", json["initial_subtasks_queued"]);
    Ok(())
}

/// List all live workers.
pub async fn cmd_workers(server: &str) -> Result<()> {
    let json = get_json(server, "/workers").await?;
    let workers = json["workers"].as_array().cloned().unwrap_or_default();

    if workers.is_empty() {
        println!("No live workers.");
        return Ok(());
    }

    for worker in &workers {
        let caps: Vec<&str> = worker["capabilities"]
            .as_array()
            .map(|a| a.iter().filter_map(|c| c.as_str()).collect())
            .unwrap_or_default();
        let availability = if worker["available"].as_bool().unwrap_or(false) {
            "available".to_string()
        } else {
            format!(
                "busy on {}",
                worker["current_subtask_id"].as_str().unwrap_or("?")
            )
        };
        println!(
            "{}  {}  [{}]  {}",
            worker["id"].as_str().unwrap_or("?"),
            worker["endpoint"].as_str().unwrap_or("?"),
            caps.join(", "),
            availability
        );
    }
    Ok(())
}

/// Cancel a pending or running task.
pub async fn cmd_cancel(server: &str, task_id: &str) -> Result<()> {
    let json = post_json(
        server,
        &format!("/tasks/{task_id}/cancel"),
        serde_json::json!({}),
    )
    .await?;
    println!(
        "Task {} is now {}",
        json["task_id"].as_str().unwrap_or(task_id),
        json["state"].as_str().unwrap_or("?")
    );
    Ok(())
}

/// Manually retry a failed task (or re-enqueue a running task's stuck
/// subtasks).
pub async fn cmd_retry(server: &str, task_id: &str) -> Result<()> {
    let json = post_json(
        server,
        &format!("/tasks/{task_id}/retry"),
        serde_json::json!({}),
    )
    .await?;
    println!(
        "Task {}: re-enqueued {} subtask(s)",
        json["task_id"].as_str().unwrap_or(task_id),
        json["requeued_subtasks"]
    );
    Ok(())
}
