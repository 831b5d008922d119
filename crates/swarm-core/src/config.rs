//! Orchestrator configuration knobs.
//!
//! Every knob has a production default; deployments override individual
//! fields through the `[orchestrator]` section of the config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::SelectionPolicy;

/// Tunable parameters for the orchestrator core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// A worker whose last heartbeat is older than this is dead.
    pub liveness_window_seconds: u64,
    /// Expected heartbeat cadence for workers (three missed beats = dead).
    pub heartbeat_interval_seconds: u64,
    /// Timeout for the dispatcher's POST to a worker.
    pub dispatch_timeout_seconds: u64,
    /// Blocking-dequeue timeout; bounds shutdown latency.
    pub dequeue_timeout_seconds: u64,
    /// Number of concurrent dispatcher loops.
    pub dispatcher_concurrency: usize,
    /// Number of concurrent result processor loops.
    pub result_processor_concurrency: usize,
    /// Durable store connection pool bounds.
    pub durable_store_pool_min: u32,
    pub durable_store_pool_max: u32,
    /// Timeout for the planner call; on expiry the decomposer falls back.
    pub planner_timeout_seconds: u64,
    /// Worker capability matching policy.
    pub selection_policy: SelectionPolicy,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            liveness_window_seconds: 60,
            heartbeat_interval_seconds: 10,
            dispatch_timeout_seconds: 5,
            dequeue_timeout_seconds: 1,
            dispatcher_concurrency: 2,
            result_processor_concurrency: 2,
            durable_store_pool_min: 2,
            durable_store_pool_max: 20,
            planner_timeout_seconds: 30,
            selection_policy: SelectionPolicy::Intersects,
        }
    }
}

impl SwarmConfig {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_seconds)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SwarmConfig::default();
        assert_eq!(cfg.liveness_window_seconds, 60);
        assert_eq!(cfg.heartbeat_interval_seconds, 10);
        assert_eq!(cfg.dispatch_timeout_seconds, 5);
        assert_eq!(cfg.dequeue_timeout_seconds, 1);
        assert_eq!(cfg.selection_policy, SelectionPolicy::Intersects);
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg: SwarmConfig = toml::from_str(
            "dispatcher_concurrency = 8\nselection_policy = \"covers\"\n",
        )
        .unwrap();
        assert_eq!(cfg.dispatcher_concurrency, 8);
        assert_eq!(cfg.selection_policy, SelectionPolicy::Covers);
        // Untouched knobs keep their defaults.
        assert_eq!(cfg.liveness_window_seconds, 60);
    }
}
