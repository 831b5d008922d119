//! End-to-end scenarios: submission through decomposition, dispatch,
//! worker execution, result processing, and aggregation, with the real
//! runtime loops running.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use swarm_core::config::SwarmConfig;
use swarm_core::coord::{CoordStore, MemoryCoordStore};
use swarm_core::decompose::Decomposer;
use swarm_core::planner::Planner;
use swarm_core::registry::Registry;
use swarm_core::runtime::OrchestratorRuntime;
use swarm_core::service::TaskService;
use swarm_db::models::{Capability, TaskState};
use swarm_test_utils::{create_test_db, drop_test_db, MockWorker, RespondFn, ScriptedPlanner};

// ===========================================================================
// Test harness
// ===========================================================================

struct E2eHarness {
    pool: sqlx::PgPool,
    db_name: String,
    coord: Arc<dyn CoordStore>,
    registry: Arc<Registry>,
    service: Arc<TaskService>,
    runtime: OrchestratorRuntime,
}

impl E2eHarness {
    async fn new(planner: Arc<dyn Planner>, config: SwarmConfig) -> Self {
        let (pool, db_name) = create_test_db().await;
        let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
        let registry = Arc::new(Registry::new(Arc::clone(&coord), config.liveness_window()));

        let service = Arc::new(TaskService::new(
            pool.clone(),
            Arc::clone(&coord),
            Arc::clone(&registry),
            Decomposer::new(planner),
            config.clone(),
        ));

        let runtime = OrchestratorRuntime::start(
            pool.clone(),
            Arc::clone(&coord),
            Arc::clone(&registry),
            config,
        )
        .expect("runtime should start");

        Self {
            pool,
            db_name,
            coord,
            registry,
            service,
            runtime,
        }
    }

    async fn spawn_worker(
        &self,
        id: &str,
        capabilities: &[Capability],
        respond: Arc<RespondFn>,
    ) -> MockWorker {
        let worker = MockWorker::spawn(
            id,
            Arc::clone(&self.coord),
            respond,
            Duration::from_millis(20),
        )
        .await;
        self.registry
            .register(worker.registration(capabilities))
            .await
            .expect("registration should succeed");
        worker
    }

    async fn task_state(&self, task_id: Uuid) -> TaskState {
        self.service
            .get_task(task_id)
            .await
            .expect("task should exist")
            .task
            .state
    }

    async fn wait_for_state(&self, task_id: Uuid, state: TaskState, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.task_state(task_id).await == state {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn teardown(self) {
        self.runtime.shutdown().await;
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ===========================================================================
// S1 -- single-subtask round trip
// ===========================================================================

#[tokio::test]
async fn s1_single_subtask_round_trip() {
    let planner = ScriptedPlanner::new(vec![ScriptedPlanner::record(
        "compute the factorial of 10",
        &[Capability::DataAnalysis],
        &[],
        5,
    )]);
    let h = E2eHarness::new(planner, SwarmConfig::default()).await;

    let _worker = h
        .spawn_worker(
            "calc-1",
            &[Capability::DataAnalysis, Capability::CodeGeneration],
            MockWorker::completing("calc-1", serde_json::json!({"factorial_10": 3628800})),
        )
        .await;

    let outcome = h
        .service
        .submit("Compute factorial of 10", Some("user-1"))
        .await
        .expect("submit should succeed");
    assert_eq!(outcome.subtasks_count, 1);
    assert_eq!(outcome.initial_subtasks_queued, 1);

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Completed, Duration::from_secs(10))
            .await,
        "task should complete"
    );

    let detail = h.service.get_task(outcome.task_id).await.unwrap();
    let aggregate = detail.task.aggregate_result.expect("aggregate should be set");
    assert_eq!(
        aggregate["subtask_results"][0]["output"]["factorial_10"],
        3628800
    );
    assert_eq!(detail.subtask_results.len(), 1);
    assert!(detail.subtask_results[0].execution_time_seconds > 0.0);

    h.teardown().await;
}

// ===========================================================================
// S2 -- linear two-step chain
// ===========================================================================

#[tokio::test]
async fn s2_linear_chain_passes_upstream_context() {
    let planner = ScriptedPlanner::new(vec![
        ScriptedPlanner::record("fetch the source page", &[Capability::WebScraping], &[], 5),
        ScriptedPlanner::record(
            "analyze the fetched page",
            &[Capability::DataAnalysis],
            &[0],
            5,
        ),
    ]);
    let h = E2eHarness::new(planner, SwarmConfig::default()).await;

    let fetcher = h
        .spawn_worker(
            "fetcher-1",
            &[Capability::WebScraping],
            MockWorker::completing("fetcher-1", serde_json::json!({"html": "<h1>hi</h1>"})),
        )
        .await;
    let analyst = h
        .spawn_worker(
            "analyst-1",
            &[Capability::DataAnalysis],
            MockWorker::completing("analyst-1", serde_json::json!({"headings": 1})),
        )
        .await;

    let outcome = h
        .service
        .submit("fetch a page and analyze it", None)
        .await
        .unwrap();
    assert_eq!(outcome.subtasks_count, 2);
    assert_eq!(outcome.initial_subtasks_queued, 1, "only the root is ready");

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Completed, Duration::from_secs(10))
            .await
    );

    // Subtask 0 was dispatched strictly before subtask 1.
    let fetch_calls = fetcher.received();
    let analyze_calls = analyst.received();
    assert_eq!(fetch_calls.len(), 1);
    assert_eq!(analyze_calls.len(), 1);
    assert!(fetch_calls[0].at <= analyze_calls[0].at);

    // The analyzer saw the fetcher's output keyed by its subtask id.
    let fetch_subtask_id = &fetch_calls[0].item.subtask.id;
    assert_eq!(
        analyze_calls[0].item.upstream_context[fetch_subtask_id]["html"],
        "<h1>hi</h1>"
    );

    h.teardown().await;
}

// ===========================================================================
// S3 -- parallel fan-out
// ===========================================================================

#[tokio::test]
async fn s3_parallel_fan_out_completes() {
    let planner = ScriptedPlanner::new(vec![
        ScriptedPlanner::record("scrape the listings page", &[Capability::WebScraping], &[], 5),
        ScriptedPlanner::record("crunch the numbers", &[Capability::DataAnalysis], &[], 5),
        ScriptedPlanner::record("call the partner api", &[Capability::ApiIntegration], &[], 5),
    ]);
    let h = E2eHarness::new(planner, SwarmConfig::default()).await;

    let scraper = h
        .spawn_worker(
            "scraper-1",
            &[Capability::WebScraping],
            MockWorker::completing("scraper-1", serde_json::json!({"pages": 3})),
        )
        .await;
    let analyst = h
        .spawn_worker(
            "analyst-1",
            &[Capability::DataAnalysis],
            MockWorker::completing("analyst-1", serde_json::json!({"mean": 0.5})),
        )
        .await;
    let integrator = h
        .spawn_worker(
            "integrator-1",
            &[Capability::ApiIntegration],
            MockWorker::completing("integrator-1", serde_json::json!({"status": "synced"})),
        )
        .await;

    let outcome = h
        .service
        .submit("scrape, crunch, and sync all at once", None)
        .await
        .unwrap();
    assert_eq!(outcome.subtasks_count, 3);
    assert_eq!(outcome.initial_subtasks_queued, 3, "all roots are ready");

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Completed, Duration::from_secs(10))
            .await
    );

    // Every worker received exactly its capability-matched subtask.
    for worker in [&scraper, &analyst, &integrator] {
        assert_eq!(worker.received().len(), 1, "worker {} share", worker.id);
    }

    let detail = h.service.get_task(outcome.task_id).await.unwrap();
    assert_eq!(detail.subtask_results.len(), 3);

    h.teardown().await;
}

// ===========================================================================
// S4 -- failure blocks the successor
// ===========================================================================

#[tokio::test]
async fn s4_failure_blocks_successor() {
    let planner = ScriptedPlanner::new(vec![
        ScriptedPlanner::record("fetch the flaky source", &[Capability::WebScraping], &[], 5),
        ScriptedPlanner::record(
            "analyze the fetched source",
            &[Capability::DataAnalysis],
            &[0],
            5,
        ),
    ]);
    let h = E2eHarness::new(planner, SwarmConfig::default()).await;

    let fetcher = h
        .spawn_worker(
            "fetcher-1",
            &[Capability::WebScraping],
            MockWorker::failing("fetcher-1", "origin returned 500"),
        )
        .await;
    let analyst = h
        .spawn_worker(
            "analyst-1",
            &[Capability::DataAnalysis],
            MockWorker::completing("analyst-1", serde_json::json!({})),
        )
        .await;

    let outcome = h
        .service
        .submit("fetch a flaky source then analyze", None)
        .await
        .unwrap();

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Failed, Duration::from_secs(10))
            .await,
        "task should fail"
    );

    // Settle briefly: nothing may reach the analyst even after the failure
    // lands.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        analyst.received().is_empty(),
        "successor of a failed subtask must never be dispatched"
    );

    let failed_subtask_id = &fetcher.received()[0].item.subtask.id;
    let detail = h.service.get_task(outcome.task_id).await.unwrap();
    let error = detail.task.error.expect("error should be set");
    assert!(
        error.contains(failed_subtask_id.as_str()),
        "error {error:?} should mention {failed_subtask_id}"
    );

    h.teardown().await;
}

// ===========================================================================
// S5 -- no matching worker, then one registers
// ===========================================================================

#[tokio::test]
async fn s5_unassignable_subtask_waits_for_matching_worker() {
    let planner = ScriptedPlanner::new(vec![ScriptedPlanner::record(
        "process the uploaded file",
        &[Capability::FileProcessing],
        &[],
        5,
    )]);
    let h = E2eHarness::new(planner, SwarmConfig::default()).await;

    let outcome = h
        .service
        .submit("process an uploaded file with nobody home", None)
        .await
        .unwrap();

    // No worker: the task stays running while the item cycles on the queue.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.task_state(outcome.task_id).await, TaskState::Running);

    // A matching worker shows up; the queued subtask reaches it.
    let _worker = h
        .spawn_worker(
            "filer-1",
            &[Capability::FileProcessing],
            MockWorker::completing("filer-1", serde_json::json!({"lines": 100})),
        )
        .await;

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Completed, Duration::from_secs(15))
            .await,
        "task should complete once a matching worker registers"
    );

    h.teardown().await;
}

// ===========================================================================
// S6 -- dead worker, manual retry
// ===========================================================================

#[tokio::test]
async fn s6_dead_worker_then_manual_retry() {
    let planner = ScriptedPlanner::new(vec![ScriptedPlanner::record(
        "analyze the quarterly data",
        &[Capability::DataAnalysis],
        &[],
        5,
    )]);
    let config = SwarmConfig {
        liveness_window_seconds: 2,
        ..SwarmConfig::default()
    };
    let h = E2eHarness::new(planner, config).await;

    // A worker that accepts the subtask and then goes silent.
    let doomed = h
        .spawn_worker(
            "doomed-1",
            &[Capability::DataAnalysis],
            MockWorker::unresponsive(),
        )
        .await;

    let outcome = h
        .service
        .submit("analyze the data on a doomed worker", None)
        .await
        .unwrap();

    let accepted = wait_until(Duration::from_secs(5), || !doomed.received().is_empty()).await;
    assert!(accepted, "doomed worker should accept the subtask");

    // The worker stops heartbeating and ages out of the snapshot.
    let died = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if h.registry.snapshot().await.unwrap().is_empty() {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    assert!(died, "dead worker must disappear from the snapshot");

    // No auto-reassignment: the task hangs in running.
    assert_eq!(h.task_state(outcome.task_id).await, TaskState::Running);

    // A replacement registers; a keeper keeps it within the short TTL.
    let replacement = h
        .spawn_worker(
            "fresh-1",
            &[Capability::DataAnalysis],
            MockWorker::completing("fresh-1", serde_json::json!({"trend": "up"})),
        )
        .await;
    let keeper = {
        let registry = Arc::clone(&h.registry);
        let reg = replacement.registration(&[Capability::DataAnalysis]);
        tokio::spawn(async move {
            loop {
                let _ = registry.register(reg.clone()).await;
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        })
    };

    // Manual retry re-enqueues the stuck subtask.
    let retry = h.service.retry(outcome.task_id).await.unwrap();
    assert_eq!(retry.requeued_subtasks, 1);

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Completed, Duration::from_secs(15))
            .await,
        "task should complete on the replacement worker"
    );
    keeper.abort();

    let detail = h.service.get_task(outcome.task_id).await.unwrap();
    assert_eq!(detail.subtask_results[0].worker_id, "fresh-1");

    h.teardown().await;
}

// ===========================================================================
// Planner failure still yields a usable task
// ===========================================================================

#[tokio::test]
async fn planner_outage_falls_back_to_single_subtask() {
    let h = E2eHarness::new(ScriptedPlanner::failing(), SwarmConfig::default()).await;

    let _worker = h
        .spawn_worker(
            "generalist-1",
            &[Capability::DataAnalysis],
            MockWorker::completing("generalist-1", serde_json::json!({"done": true})),
        )
        .await;

    let outcome = h
        .service
        .submit("the planner is down but this still runs", None)
        .await
        .expect("submission must survive a planner outage");
    assert_eq!(outcome.subtasks_count, 1);

    assert!(
        h.wait_for_state(outcome.task_id, TaskState::Completed, Duration::from_secs(10))
            .await
    );

    h.teardown().await;
}
