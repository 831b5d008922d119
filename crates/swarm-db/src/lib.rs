//! Durable store for the swarm orchestrator: PostgreSQL pool management,
//! runtime migrations, row models, and query functions for the `tasks`,
//! `subtask_results`, and `activity_logs` tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
