//! In-process coordination store.
//!
//! Queues are `VecDeque`s guarded by async mutexes with a `Notify` per
//! queue for blocking dequeues; worker hashes and state keys carry an
//! expiry instant and are filtered (and pruned) on read. Suitable for a
//! single-process deployment and for tests; a networked store implements
//! the same trait for multi-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{CoordError, CoordStore, WorkerStatus};

/// One FIFO queue with blocking pop support.
#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl Queue {
    async fn push(&self, item: String) {
        self.items.lock().await.push_back(item);
        self.notify.notify_one();
    }

    async fn pop(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the wakeup before checking the queue so a push between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    // `Notify` stores at most one permit; hand it on when
                    // items remain so a second waiter is not stranded.
                    if !items.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

struct WorkerEntry {
    status: WorkerStatus,
    expires_at: Instant,
}

struct StateEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// The in-memory [`CoordStore`] implementation.
#[derive(Default)]
pub struct MemoryCoordStore {
    work_queue: Queue,
    result_queue: Queue,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    queued: Mutex<HashMap<Uuid, HashSet<String>>>,
    state: Mutex<HashMap<String, StateEntry>>,
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn push_work(&self, item: String) -> Result<(), CoordError> {
        self.work_queue.push(item).await;
        Ok(())
    }

    async fn pop_work(&self, timeout: Duration) -> Result<Option<String>, CoordError> {
        Ok(self.work_queue.pop(timeout).await)
    }

    async fn work_queue_len(&self) -> Result<usize, CoordError> {
        Ok(self.work_queue.len().await)
    }

    async fn push_result(&self, item: String) -> Result<(), CoordError> {
        self.result_queue.push(item).await;
        Ok(())
    }

    async fn pop_result(&self, timeout: Duration) -> Result<Option<String>, CoordError> {
        Ok(self.result_queue.pop(timeout).await)
    }

    async fn result_queue_len(&self) -> Result<usize, CoordError> {
        Ok(self.result_queue.len().await)
    }

    async fn put_worker(&self, status: &WorkerStatus, ttl: Duration) -> Result<(), CoordError> {
        let mut workers = self.workers.lock().await;
        workers.insert(
            status.id.clone(),
            WorkerEntry {
                status: status.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerStatus>, CoordError> {
        let mut workers = self.workers.lock().await;
        match workers.get(worker_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.status.clone())),
            Some(_) => {
                workers.remove(worker_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn live_workers(&self) -> Result<Vec<WorkerStatus>, CoordError> {
        let mut workers = self.workers.lock().await;
        let now = Instant::now();
        workers.retain(|_, entry| entry.expires_at > now);
        Ok(workers.values().map(|e| e.status.clone()).collect())
    }

    async fn set_worker_availability(
        &self,
        worker_id: &str,
        available: bool,
        current_subtask_id: Option<String>,
    ) -> Result<bool, CoordError> {
        let mut workers = self.workers.lock().await;
        match workers.get_mut(worker_id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.status.available = available;
                entry.status.current_subtask_id = current_subtask_id;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_queued(&self, task_id: Uuid, subtask_id: &str) -> Result<bool, CoordError> {
        let mut queued = self.queued.lock().await;
        Ok(queued
            .entry(task_id)
            .or_default()
            .insert(subtask_id.to_string()))
    }

    async fn unmark_queued(&self, task_id: Uuid, subtask_id: &str) -> Result<(), CoordError> {
        let mut queued = self.queued.lock().await;
        if let Some(set) = queued.get_mut(&task_id) {
            set.remove(subtask_id);
        }
        Ok(())
    }

    async fn queued_subtasks(&self, task_id: Uuid) -> Result<HashSet<String>, CoordError> {
        let queued = self.queued.lock().await;
        Ok(queued.get(&task_id).cloned().unwrap_or_default())
    }

    async fn set_state(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError> {
        let mut state = self.state.lock().await;
        state.insert(
            key.to_string(),
            StateEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut state = self.state.lock().await;
        match state.get(key) {
            Some(entry) => {
                if let Some(expires_at) = entry.expires_at {
                    if expires_at <= Instant::now() {
                        state.remove(key);
                        return Ok(None);
                    }
                }
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use swarm_db::models::Capability;

    fn worker(id: &str) -> WorkerStatus {
        WorkerStatus {
            id: id.to_string(),
            endpoint: format!("http://localhost:9000/{id}"),
            capabilities: vec![Capability::DataAnalysis],
            available: true,
            current_subtask_id: None,
            cpu_pct: 10.0,
            mem_pct: 20.0,
            completed_count: 0,
            last_heartbeat_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn work_queue_is_fifo() {
        let store = MemoryCoordStore::new();
        store.push_work("a".into()).await.unwrap();
        store.push_work("b".into()).await.unwrap();
        store.push_work("c".into()).await.unwrap();

        assert_eq!(store.work_queue_len().await.unwrap(), 3);
        let a = store.pop_work(Duration::from_millis(10)).await.unwrap();
        let b = store.pop_work(Duration::from_millis(10)).await.unwrap();
        let c = store.pop_work(Duration::from_millis(10)).await.unwrap();
        assert_eq!(a.as_deref(), Some("a"));
        assert_eq!(b.as_deref(), Some("b"));
        assert_eq!(c.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let store = MemoryCoordStore::new();
        let popped = store.pop_work(Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let store = Arc::new(MemoryCoordStore::new());
        let consumer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.pop_result(Duration::from_secs(5)).await.unwrap() })
        };

        // Give the consumer a moment to block.
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.push_result("r1".into()).await.unwrap();

        let popped = consumer.await.unwrap();
        assert_eq!(popped.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn concurrent_pops_deliver_each_item_once() {
        let store = Arc::new(MemoryCoordStore::new());
        for i in 0..50 {
            store.push_work(format!("item-{i}")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(item) = store.pop_work(Duration::from_millis(50)).await.unwrap() {
                    taken.push(item);
                }
                taken
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50, "every item delivered to exactly one consumer");
    }

    #[tokio::test]
    async fn worker_ttl_expires() {
        tokio::time::pause();
        let store = MemoryCoordStore::new();
        store
            .put_worker(&worker("w1"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.live_workers().await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.live_workers().await.unwrap().is_empty());
        assert!(store.get_worker("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_ttl() {
        tokio::time::pause();
        let store = MemoryCoordStore::new();
        store
            .put_worker(&worker("w1"), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        store
            .put_worker(&worker("w1"), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        // 80s since registration, but only 40s since the refresh.
        assert_eq!(store.live_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn availability_flip_preserves_ttl() {
        tokio::time::pause();
        let store = MemoryCoordStore::new();
        store
            .put_worker(&worker("w1"), Duration::from_secs(60))
            .await
            .unwrap();

        let flipped = store
            .set_worker_availability("w1", false, Some("st-1".into()))
            .await
            .unwrap();
        assert!(flipped);

        let status = store.get_worker("w1").await.unwrap().unwrap();
        assert!(!status.available);
        assert_eq!(status.current_subtask_id.as_deref(), Some("st-1"));

        // The flip did not extend the TTL.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get_worker("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn availability_flip_on_unknown_worker() {
        let store = MemoryCoordStore::new();
        let flipped = store
            .set_worker_availability("ghost", false, None)
            .await
            .unwrap();
        assert!(!flipped);
    }

    #[tokio::test]
    async fn mark_queued_dedups() {
        let store = MemoryCoordStore::new();
        let task_id = Uuid::new_v4();

        assert!(store.mark_queued(task_id, "st-1").await.unwrap());
        assert!(!store.mark_queued(task_id, "st-1").await.unwrap());
        assert!(store.mark_queued(task_id, "st-2").await.unwrap());

        let queued = store.queued_subtasks(task_id).await.unwrap();
        assert_eq!(queued.len(), 2);

        store.unmark_queued(task_id, "st-1").await.unwrap();
        assert!(store.mark_queued(task_id, "st-1").await.unwrap());
    }

    #[tokio::test]
    async fn state_ttl_expires() {
        tokio::time::pause();
        let store = MemoryCoordStore::new();
        store
            .set_state("k", "v".into(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.get_state("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get_state("k").await.unwrap().is_none());

        // No TTL means the key persists.
        store.set_state("p", "q".into(), None).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(store.get_state("p").await.unwrap().as_deref(), Some("q"));
    }
}
