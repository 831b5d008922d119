//! Orchestration core for the swarm: task decomposition, capability-matched
//! dispatch, result processing with DAG advancement, and the worker
//! registry.
//!
//! Everything hangs off injected handles (database pool, coordination
//! store, planner); there are no process-wide singletons. The long-lived
//! loops live in [`runtime`], the API-facing operations in [`service`].

pub mod activity;
pub mod config;
pub mod coord;
pub mod decompose;
pub mod dispatch;
pub mod planner;
pub mod registry;
pub mod results;
pub mod runtime;
pub mod service;
pub mod worker_client;
