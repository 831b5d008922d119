//! Worker registry: registration, heartbeat TTL, capability-filtered
//! availability.
//!
//! A typed facade over the coordination store's worker hashes. Liveness is
//! purely TTL-driven: a worker that stops heartbeating simply ages out of
//! every read path; there is no explicit deregistration requirement.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use swarm_db::models::Capability;

use crate::coord::{CoordError, CoordStore, WorkerStatus};

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

/// How a worker's capability set is matched against a subtask's
/// requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// The worker can handle at least one required capability.
    Intersects,
    /// The worker's capabilities are a superset of the requirements.
    Covers,
}

impl SelectionPolicy {
    /// Whether a worker with `worker_caps` qualifies for `required` under
    /// this policy.
    pub fn matches(self, worker_caps: &[Capability], required: &[Capability]) -> bool {
        match self {
            Self::Intersects => required.iter().any(|c| worker_caps.contains(c)),
            Self::Covers => required.iter().all(|c| worker_caps.contains(c)),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Intersects => "intersects",
            Self::Covers => "covers",
        };
        f.write_str(s)
    }
}

impl FromStr for SelectionPolicy {
    type Err = SelectionPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intersects" => Ok(Self::Intersects),
            "covers" => Ok(Self::Covers),
            other => Err(SelectionPolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SelectionPolicy`] string.
#[derive(Debug, Clone)]
pub struct SelectionPolicyParseError(pub String);

impl fmt::Display for SelectionPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid selection policy: {:?}", self.0)
    }
}

impl std::error::Error for SelectionPolicyParseError {}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// Registration request from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
}

/// Heartbeat payload from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatUpdate {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subtask_id: Option<String>,
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub mem_pct: f64,
    #[serde(default)]
    pub completed_count: i64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker {0:?} is not registered (or its ttl expired)")]
    UnknownWorker(String),

    #[error("worker must advertise at least one capability")]
    NoCapabilities,

    #[error(transparent)]
    Coord(#[from] CoordError),
}

/// Tracks live workers and answers the dispatcher's availability queries.
pub struct Registry {
    coord: Arc<dyn CoordStore>,
    ttl: Duration,
}

impl Registry {
    /// `liveness_window` doubles as the status TTL: a worker that misses it
    /// is dead.
    pub fn new(coord: Arc<dyn CoordStore>, liveness_window: Duration) -> Self {
        Self {
            coord,
            ttl: liveness_window,
        }
    }

    /// Register a worker, marking it available.
    pub async fn register(&self, reg: WorkerRegistration) -> Result<WorkerStatus, RegistryError> {
        if reg.capabilities.is_empty() {
            return Err(RegistryError::NoCapabilities);
        }

        let status = WorkerStatus {
            id: reg.id,
            endpoint: reg.endpoint,
            capabilities: reg.capabilities,
            available: true,
            current_subtask_id: None,
            cpu_pct: 0.0,
            mem_pct: 0.0,
            completed_count: 0,
            last_heartbeat_at: Utc::now(),
        };
        self.coord.put_worker(&status, self.ttl).await?;

        tracing::info!(
            worker_id = %status.id,
            endpoint = %status.endpoint,
            capabilities = ?status.capabilities,
            "worker registered"
        );
        Ok(status)
    }

    /// Refresh a worker's status and extend its TTL.
    ///
    /// The worker must still be live; a worker that aged out has to
    /// re-register so its endpoint and capabilities are known again.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        update: HeartbeatUpdate,
    ) -> Result<WorkerStatus, RegistryError> {
        let Some(mut status) = self.coord.get_worker(worker_id).await? else {
            return Err(RegistryError::UnknownWorker(worker_id.to_string()));
        };

        status.available = update.available;
        status.current_subtask_id = update.current_subtask_id;
        status.cpu_pct = update.cpu_pct;
        status.mem_pct = update.mem_pct;
        status.completed_count = update.completed_count;
        status.last_heartbeat_at = Utc::now();

        self.coord.put_worker(&status, self.ttl).await?;
        Ok(status)
    }

    /// All live workers. TTL-expired workers are never observed here.
    pub async fn snapshot(&self) -> Result<Vec<WorkerStatus>, RegistryError> {
        Ok(self.coord.live_workers().await?)
    }

    /// Live, available workers qualifying for `required` under `policy`.
    pub async fn available_for(
        &self,
        required: &[Capability],
        policy: SelectionPolicy,
    ) -> Result<Vec<WorkerStatus>, RegistryError> {
        let workers = self.coord.live_workers().await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.available && policy.matches(&w.capabilities, required))
            .collect())
    }

    /// Best-effort busy marking after a successful dispatch. The worker
    /// self-reports on its next heartbeat either way.
    pub async fn mark_busy(&self, worker_id: &str, subtask_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .coord
            .set_worker_availability(worker_id, false, Some(subtask_id.to_string()))
            .await?)
    }

    /// Best-effort availability marking after a result is processed.
    pub async fn mark_available(&self, worker_id: &str) -> Result<bool, RegistryError> {
        Ok(self
            .coord
            .set_worker_availability(worker_id, true, None)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryCoordStore::new()), Duration::from_secs(60))
    }

    fn registration(id: &str, caps: &[Capability]) -> WorkerRegistration {
        WorkerRegistration {
            id: id.to_string(),
            endpoint: format!("http://localhost:9000/{id}"),
            capabilities: caps.to_vec(),
        }
    }

    fn idle_heartbeat() -> HeartbeatUpdate {
        HeartbeatUpdate {
            available: true,
            current_subtask_id: None,
            cpu_pct: 5.0,
            mem_pct: 10.0,
            completed_count: 3,
        }
    }

    #[test]
    fn policy_intersects() {
        let worker = [Capability::DataAnalysis, Capability::WebScraping];
        let required = [Capability::WebScraping, Capability::CodeGeneration];
        assert!(SelectionPolicy::Intersects.matches(&worker, &required));
        assert!(!SelectionPolicy::Covers.matches(&worker, &required));
    }

    #[test]
    fn policy_covers() {
        let worker = [
            Capability::DataAnalysis,
            Capability::WebScraping,
            Capability::CodeGeneration,
        ];
        let required = [Capability::WebScraping, Capability::CodeGeneration];
        assert!(SelectionPolicy::Covers.matches(&worker, &required));
    }

    #[test]
    fn policy_display_roundtrip() {
        for p in [SelectionPolicy::Intersects, SelectionPolicy::Covers] {
            let parsed: SelectionPolicy = p.to_string().parse().expect("should parse");
            assert_eq!(p, parsed);
        }
        assert!("random".parse::<SelectionPolicy>().is_err());
    }

    #[tokio::test]
    async fn register_and_snapshot() {
        let registry = registry();
        registry
            .register(registration("w1", &[Capability::DataAnalysis]))
            .await
            .unwrap();

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "w1");
        assert!(snapshot[0].available);
    }

    #[tokio::test]
    async fn register_requires_capabilities() {
        let registry = registry();
        let err = registry.register(registration("w1", &[])).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoCapabilities));
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_fails() {
        let registry = registry();
        let err = registry
            .heartbeat("ghost", idle_heartbeat())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn dead_worker_never_observed() {
        tokio::time::pause();
        let registry = registry();
        registry
            .register(registration("w1", &[Capability::DataAnalysis]))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(registry.snapshot().await.unwrap().is_empty());
        let available = registry
            .available_for(&[Capability::DataAnalysis], SelectionPolicy::Intersects)
            .await
            .unwrap();
        assert!(available.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_worker_live() {
        tokio::time::pause();
        let registry = registry();
        registry
            .register(registration("w1", &[Capability::DataAnalysis]))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        registry.heartbeat("w1", idle_heartbeat()).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].completed_count, 3);
    }

    #[tokio::test]
    async fn available_for_filters_busy_and_mismatched() {
        let registry = registry();
        registry
            .register(registration("scraper", &[Capability::WebScraping]))
            .await
            .unwrap();
        registry
            .register(registration("analyst", &[Capability::DataAnalysis]))
            .await
            .unwrap();
        registry
            .register(registration("busy", &[Capability::WebScraping]))
            .await
            .unwrap();
        registry.mark_busy("busy", "st-1").await.unwrap();

        let available = registry
            .available_for(&[Capability::WebScraping], SelectionPolicy::Intersects)
            .await
            .unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "scraper");
    }

    #[tokio::test]
    async fn mark_busy_then_available() {
        let registry = registry();
        registry
            .register(registration("w1", &[Capability::ApiIntegration]))
            .await
            .unwrap();

        assert!(registry.mark_busy("w1", "st-9").await.unwrap());
        let snapshot = registry.snapshot().await.unwrap();
        assert!(!snapshot[0].available);
        assert_eq!(snapshot[0].current_subtask_id.as_deref(), Some("st-9"));

        assert!(registry.mark_available("w1").await.unwrap());
        let snapshot = registry.snapshot().await.unwrap();
        assert!(snapshot[0].available);
        assert!(snapshot[0].current_subtask_id.is_none());
    }
}
