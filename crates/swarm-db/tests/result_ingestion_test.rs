//! Integration tests for subtask result ingestion.
//!
//! The load-bearing property: ingestion is idempotent on
//! `(task_id, subtask_id)`, so an at-least-once result queue cannot
//! produce duplicate rows.

use uuid::Uuid;

use swarm_db::models::{NewSubTaskResult, Outcome};
use swarm_db::queries::{subtask_results, tasks};
use swarm_test_utils::{create_test_db, drop_test_db};

async fn create_task(pool: &sqlx::PgPool) -> Uuid {
    let id = Uuid::now_v7();
    tasks::insert_task(pool, id, "user-1", "a task that receives results")
        .await
        .expect("insert_task should succeed");
    id
}

fn completed(task_id: Uuid, subtask_id: &str) -> NewSubTaskResult {
    NewSubTaskResult {
        task_id,
        subtask_id: subtask_id.to_string(),
        worker_id: "worker-a".to_string(),
        outcome: Outcome::Completed,
        output: Some(serde_json::json!({"value": 42})),
        error: None,
        execution_time_seconds: 1.25,
        created_at: None,
    }
}

fn failed(task_id: Uuid, subtask_id: &str) -> NewSubTaskResult {
    NewSubTaskResult {
        task_id,
        subtask_id: subtask_id.to_string(),
        worker_id: "worker-b".to_string(),
        outcome: Outcome::Failed,
        output: None,
        error: Some("connection reset by peer".to_string()),
        execution_time_seconds: 0.5,
        created_at: None,
    }
}

#[tokio::test]
async fn insert_and_list_results() {
    let (pool, db_name) = create_test_db().await;
    let task_id = create_task(&pool).await;

    let inserted = subtask_results::insert_result(&pool, &completed(task_id, "st-a"))
        .await
        .expect("insert should succeed");
    assert!(inserted);

    let inserted = subtask_results::insert_result(&pool, &failed(task_id, "st-b"))
        .await
        .expect("insert should succeed");
    assert!(inserted);

    let results = subtask_results::list_results_for_task(&pool, task_id)
        .await
        .expect("list should succeed");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].subtask_id, "st-a");
    assert_eq!(results[0].outcome, Outcome::Completed);
    assert_eq!(results[0].output.as_ref().unwrap()["value"], 42);
    assert!(results[0].execution_time_seconds > 0.0);
    assert_eq!(results[1].outcome, Outcome::Failed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_delivery_is_a_noop() {
    let (pool, db_name) = create_test_db().await;
    let task_id = create_task(&pool).await;

    let first = subtask_results::insert_result(&pool, &completed(task_id, "st-a"))
        .await
        .unwrap();
    assert!(first);

    // Replay the same message several times -- exactly one row survives.
    for _ in 0..5 {
        let replay = subtask_results::insert_result(&pool, &completed(task_id, "st-a"))
            .await
            .unwrap();
        assert!(!replay, "duplicate delivery must be a no-op");
    }

    // Even a conflicting outcome for the same subtask does not overwrite.
    let conflicting = subtask_results::insert_result(&pool, &failed(task_id, "st-a"))
        .await
        .unwrap();
    assert!(!conflicting);

    let count = subtask_results::count_results(&pool, task_id).await.unwrap();
    assert_eq!(count, 1);

    let row = subtask_results::get_result(&pool, task_id, "st-a")
        .await
        .unwrap()
        .expect("row should exist");
    assert_eq!(row.outcome, Outcome::Completed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn same_subtask_id_in_different_tasks() {
    let (pool, db_name) = create_test_db().await;
    let task_a = create_task(&pool).await;
    let task_b = create_task(&pool).await;

    assert!(
        subtask_results::insert_result(&pool, &completed(task_a, "st-1"))
            .await
            .unwrap()
    );
    assert!(
        subtask_results::insert_result(&pool, &completed(task_b, "st-1"))
            .await
            .unwrap(),
        "uniqueness is scoped per task"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_failed_supersedes_only_failures() {
    let (pool, db_name) = create_test_db().await;
    let task_id = create_task(&pool).await;

    subtask_results::insert_result(&pool, &completed(task_id, "st-a"))
        .await
        .unwrap();
    subtask_results::insert_result(&pool, &failed(task_id, "st-b"))
        .await
        .unwrap();
    subtask_results::insert_result(&pool, &failed(task_id, "st-c"))
        .await
        .unwrap();

    let deleted = subtask_results::delete_failed_results(&pool, task_id)
        .await
        .unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.iter().all(|r| r.outcome == Outcome::Failed));

    let remaining = subtask_results::list_results_for_task(&pool, task_id)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subtask_id, "st-a");

    // The freed slots accept fresh results again.
    assert!(
        subtask_results::insert_result(&pool, &completed(task_id, "st-b"))
            .await
            .unwrap()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_timestamp_is_respected() {
    let (pool, db_name) = create_test_db().await;
    let task_id = create_task(&pool).await;

    let worker_clock = chrono::Utc::now() - chrono::Duration::minutes(5);
    let mut result = completed(task_id, "st-a");
    result.created_at = Some(worker_clock);

    subtask_results::insert_result(&pool, &result).await.unwrap();

    let row = subtask_results::get_result(&pool, task_id, "st-a")
        .await
        .unwrap()
        .unwrap();
    let drift = (row.created_at - worker_clock).num_seconds().abs();
    assert!(drift < 2, "stored timestamp should match the worker's clock");

    pool.close().await;
    drop_test_db(&db_name).await;
}
