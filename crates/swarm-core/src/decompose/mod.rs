//! Decomposer: turns a validated task description into a DAG of subtasks.
//!
//! Wraps the planner boundary and normalizes its raw records: mints fresh
//! subtask ids, rewrites index-based dependencies to id form, clamps
//! priorities, drops duplicate and self dependencies, and rejects cyclic
//! graphs via Kahn's algorithm. Every planner defect collapses to the same
//! conservative fallback: a single-subtask plan covering the whole task
//! description.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use swarm_db::models::{Capability, SubTask};

use crate::planner::{PlanRecord, Planner};

/// Capability assigned to the fallback subtask.
pub const FALLBACK_CAPABILITY: Capability = Capability::DataAnalysis;

/// Priority assigned to the fallback subtask.
pub const FALLBACK_PRIORITY: u8 = 5;

/// Subtask descriptions are bounded independently of task descriptions.
const MAX_SUBTASK_DESCRIPTION: usize = 1000;
const MIN_SUBTASK_DESCRIPTION: usize = 10;

/// Errors that reject a planner output during normalization.
///
/// These never surface to the submitter; the decomposer logs them at WARN
/// and falls back.
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("planner returned an empty plan")]
    EmptyPlan,

    #[error("every planner record was dropped during validation")]
    AllDropped,

    #[error("record {record} has dependency index {index} out of range")]
    BadDependencyIndex { record: usize, index: usize },

    #[error("record {record} depends on dropped record {index}")]
    DanglingDependency { record: usize, index: usize },

    #[error("dependency cycle detected involving subtasks: {0}")]
    Cyclic(String),
}

/// A validated decomposition: the full subtask list in declaration order.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub subtasks: Vec<SubTask>,
    /// True when the planner output was unusable and the single-subtask
    /// fallback was taken.
    pub used_fallback: bool,
}

/// The decomposer. Construct once with an injected planner and share.
pub struct Decomposer {
    planner: Arc<dyn Planner>,
}

impl Decomposer {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self { planner }
    }

    /// Decompose a task description into a DAG of subtasks.
    ///
    /// Never fails: planner errors, unparsable output, and invalid graphs
    /// all take the fallback path.
    pub async fn decompose(&self, description: &str) -> Decomposition {
        let records = match self.planner.plan(description, &Capability::ALL).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "planner call failed, using single-subtask fallback");
                return fallback(description);
            }
        };

        match normalize(&records) {
            Ok(subtasks) => Decomposition {
                subtasks,
                used_fallback: false,
            },
            Err(e) => {
                tracing::warn!(error = %e, "planner output rejected, using single-subtask fallback");
                fallback(description)
            }
        }
    }
}

/// Mint a fresh subtask id, unique within the task (and globally, in
/// practice).
fn mint_subtask_id() -> String {
    format!("st-{}", Uuid::new_v4().simple())
}

/// Build the conservative single-subtask plan for a description.
pub fn fallback(description: &str) -> Decomposition {
    let truncated: String = description.chars().take(MAX_SUBTASK_DESCRIPTION).collect();
    Decomposition {
        subtasks: vec![SubTask {
            id: mint_subtask_id(),
            description: truncated,
            required_capabilities: vec![FALLBACK_CAPABILITY],
            dependencies: Vec::new(),
            priority: FALLBACK_PRIORITY,
            estimated_duration_seconds: None,
            input_data: serde_json::json!({}),
        }],
        used_fallback: true,
    }
}

/// Normalize raw planner records into validated subtasks.
fn normalize(records: &[PlanRecord]) -> Result<Vec<SubTask>, DecomposeError> {
    if records.is_empty() {
        return Err(DecomposeError::EmptyPlan);
    }

    // First pass: decide which records survive. A record is dropped when it
    // references a capability outside the vocabulary, has no capabilities at
    // all, or has a description outside the subtask bounds.
    let mut capabilities: Vec<Option<Vec<Capability>>> = Vec::with_capacity(records.len());
    for record in records {
        let len = record.description.chars().count();
        if len < MIN_SUBTASK_DESCRIPTION || len > MAX_SUBTASK_DESCRIPTION {
            capabilities.push(None);
            continue;
        }
        let mut caps: Vec<Capability> = Vec::with_capacity(record.required_capabilities.len());
        let mut valid = !record.required_capabilities.is_empty();
        for raw in &record.required_capabilities {
            match raw.parse::<Capability>() {
                Ok(cap) => {
                    if !caps.contains(&cap) {
                        caps.push(cap);
                    }
                }
                Err(_) => {
                    valid = false;
                    break;
                }
            }
        }
        capabilities.push(valid.then_some(caps));
    }

    if capabilities.iter().all(Option::is_none) {
        return Err(DecomposeError::AllDropped);
    }

    // Mint ids for the survivors and build the index -> id map.
    let ids: Vec<Option<String>> = capabilities
        .iter()
        .map(|caps| caps.as_ref().map(|_| mint_subtask_id()))
        .collect();

    // Second pass: rewrite dependencies, clamp priorities, assemble subtasks.
    let mut subtasks = Vec::new();
    for (idx, record) in records.iter().enumerate() {
        let Some(caps) = &capabilities[idx] else {
            continue;
        };
        let id = ids[idx].clone().unwrap_or_default();

        let mut dependencies = Vec::new();
        for &dep_idx in &record.dependencies {
            if dep_idx >= records.len() {
                return Err(DecomposeError::BadDependencyIndex {
                    record: idx,
                    index: dep_idx,
                });
            }
            // Self-dependencies are dropped silently.
            if dep_idx == idx {
                continue;
            }
            let Some(dep_id) = &ids[dep_idx] else {
                // A surviving record depending on a dropped one leaves the
                // plan unexecutable; reject the whole output.
                return Err(DecomposeError::DanglingDependency {
                    record: idx,
                    index: dep_idx,
                });
            };
            if !dependencies.contains(dep_id) {
                dependencies.push(dep_id.clone());
            }
        }

        subtasks.push(SubTask {
            id,
            description: record.description.clone(),
            required_capabilities: caps.clone(),
            dependencies,
            priority: record.priority.clamp(0, 10) as u8,
            estimated_duration_seconds: record.estimated_duration_seconds,
            input_data: record.input_data.clone(),
        });
    }

    check_for_cycles(&subtasks)?;

    Ok(subtasks)
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
///
/// Returns `Ok(())` if the graph is a DAG, or `Err` naming the subtasks
/// left unsorted (the cycle participants).
pub fn check_for_cycles(subtasks: &[SubTask]) -> Result<(), DecomposeError> {
    let id_to_idx: HashMap<&str, usize> = subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let n = subtasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (idx, subtask) in subtasks.iter().enumerate() {
        for dep_id in &subtask.dependencies {
            if let Some(&dep_idx) = id_to_idx.get(dep_id.as_str()) {
                // Edge: dep -> subtask (dep must complete before subtask).
                adj[dep_idx].push(idx);
                in_degree[idx] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_ids: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| subtasks[i].id.as_str())
            .collect();
        return Err(DecomposeError::Cyclic(cycle_ids.join(", ")));
    }

    Ok(())
}

/// Compute the initial ready set: subtasks with no dependencies, ordered by
/// descending priority with declaration order as the stable tie-break.
pub fn initial_ready_set(subtasks: &[SubTask]) -> Vec<SubTask> {
    let mut ready: Vec<SubTask> = subtasks
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .cloned()
        .collect();
    ready.sort_by_key(|s| std::cmp::Reverse(s.priority));
    ready
}

/// Compute, for each subtask, the set of ids whose completion it unblocks.
///
/// Adjacency view used by tests and by callers that want to reason about
/// transitive successors of a failed subtask.
pub fn successors(subtasks: &[SubTask]) -> HashMap<String, HashSet<String>> {
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for subtask in subtasks {
        map.entry(subtask.id.clone()).or_default();
        for dep in &subtask.dependencies {
            map.entry(dep.clone()).or_default().insert(subtask.id.clone());
        }
    }
    map
}
