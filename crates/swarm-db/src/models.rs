use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether the state is terminal (no further transitions except the
    /// explicit manual retry path out of `failed`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// Outcome reported by a worker for a single subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for Outcome {
    type Err = OutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(OutcomeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Outcome`] string.
#[derive(Debug, Clone)]
pub struct OutcomeParseError(pub String);

impl fmt::Display for OutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask outcome: {:?}", self.0)
    }
}

impl std::error::Error for OutcomeParseError {}

// ---------------------------------------------------------------------------

/// Severity level of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Debug,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(LogLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogLevel`] string.
#[derive(Debug, Clone)]
pub struct LogLevelParseError(pub String);

impl fmt::Display for LogLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for LogLevelParseError {}

// ---------------------------------------------------------------------------

/// A capability a worker can advertise and a subtask can require.
///
/// The vocabulary is fixed; strings appear only at the wire boundary
/// (snake_case JSON values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DataAnalysis,
    WebScraping,
    CodeGeneration,
    FileProcessing,
    DatabaseOperations,
    ApiIntegration,
}

impl Capability {
    /// The full capability vocabulary, in canonical order.
    pub const ALL: [Capability; 6] = [
        Capability::DataAnalysis,
        Capability::WebScraping,
        Capability::CodeGeneration,
        Capability::FileProcessing,
        Capability::DatabaseOperations,
        Capability::ApiIntegration,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DataAnalysis => "data_analysis",
            Self::WebScraping => "web_scraping",
            Self::CodeGeneration => "code_generation",
            Self::FileProcessing => "file_processing",
            Self::DatabaseOperations => "database_operations",
            Self::ApiIntegration => "api_integration",
        };
        f.write_str(s)
    }
}

impl FromStr for Capability {
    type Err = CapabilityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_analysis" => Ok(Self::DataAnalysis),
            "web_scraping" => Ok(Self::WebScraping),
            "code_generation" => Ok(Self::CodeGeneration),
            "file_processing" => Ok(Self::FileProcessing),
            "database_operations" => Ok(Self::DatabaseOperations),
            "api_integration" => Ok(Self::ApiIntegration),
            other => Err(CapabilityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing a string outside the capability vocabulary.
#[derive(Debug, Clone)]
pub struct CapabilityParseError(pub String);

impl fmt::Display for CapabilityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown capability: {:?}", self.0)
    }
}

impl std::error::Error for CapabilityParseError {}

// ---------------------------------------------------------------------------
// Blob types
// ---------------------------------------------------------------------------

/// The smallest schedulable unit of work, assigned to one worker.
///
/// Stored as an element of the `subtasks` JSONB blob on the task row; the
/// same shape travels on the wire inside dispatch requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Opaque id, unique within the task.
    pub id: String,
    pub description: String,
    pub required_capabilities: Vec<Capability>,
    /// Ids of subtasks within the same task that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 0..10, higher is more urgent.
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_seconds: Option<u64>,
    #[serde(default)]
    pub input_data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one user submission, decomposed into a DAG of subtasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub submitter_id: String,
    pub description: String,
    pub state: TaskState,
    pub subtasks: Json<Vec<SubTask>>,
    pub aggregate_result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Look up a subtask in the blob by id.
    pub fn subtask(&self, subtask_id: &str) -> Option<&SubTask> {
        self.subtasks.0.iter().find(|s| s.id == subtask_id)
    }
}

/// A persisted worker-reported outcome for one subtask.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubTaskResult {
    pub id: i64,
    pub task_id: Uuid,
    pub subtask_id: String,
    pub worker_id: String,
    pub outcome: Outcome,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_seconds: f64,
    pub created_at: DateTime<Utc>,
}

/// Wire shape of a result message as produced by a worker.
///
/// This is what sits on the result queue; ingestion turns it into a
/// [`SubTaskResult`] row (idempotently, keyed on `(task_id, subtask_id)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubTaskResult {
    pub task_id: Uuid,
    pub subtask_id: String,
    pub worker_id: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_seconds: f64,
    /// Worker-side timestamp; the row falls back to the server clock when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// An append-only activity log entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityLog {
    pub id: i64,
    pub worker_id: String,
    pub task_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_display_roundtrip() {
        let variants = [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_state_invalid() {
        let result = "bogus".parse::<TaskState>();
        assert!(result.is_err());
    }

    #[test]
    fn task_state_terminality() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn outcome_display_roundtrip() {
        for v in &[Outcome::Completed, Outcome::Failed] {
            let parsed: Outcome = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn outcome_invalid() {
        assert!("accepted".parse::<Outcome>().is_err());
    }

    #[test]
    fn log_level_display_roundtrip() {
        let variants = [LogLevel::Info, LogLevel::Debug, LogLevel::Warn, LogLevel::Error];
        for v in &variants {
            let parsed: LogLevel = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn log_level_invalid() {
        assert!("trace".parse::<LogLevel>().is_err());
    }

    #[test]
    fn capability_display_roundtrip() {
        for v in &Capability::ALL {
            let parsed: Capability = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn capability_invalid() {
        assert!("quantum_computing".parse::<Capability>().is_err());
    }

    #[test]
    fn capability_serde_wire_form() {
        let json = serde_json::to_string(&Capability::WebScraping).unwrap();
        assert_eq!(json, "\"web_scraping\"");
        let parsed: Capability = serde_json::from_str("\"api_integration\"").unwrap();
        assert_eq!(parsed, Capability::ApiIntegration);
    }

    #[test]
    fn subtask_serde_defaults() {
        let json = serde_json::json!({
            "id": "st-1",
            "description": "analyze the dataset",
            "required_capabilities": ["data_analysis"],
            "priority": 5
        });
        let subtask: SubTask = serde_json::from_value(json).unwrap();
        assert!(subtask.dependencies.is_empty());
        assert!(subtask.estimated_duration_seconds.is_none());
        assert!(subtask.input_data.is_null() || subtask.input_data == serde_json::json!({}));
    }

    #[test]
    fn subtask_serde_roundtrip() {
        let subtask = SubTask {
            id: "st-abc".to_string(),
            description: "scrape the listings page".to_string(),
            required_capabilities: vec![Capability::WebScraping],
            dependencies: vec!["st-root".to_string()],
            priority: 7,
            estimated_duration_seconds: Some(120),
            input_data: serde_json::json!({"url": "https://example.com"}),
        };
        let json = serde_json::to_value(&subtask).unwrap();
        assert_eq!(json["required_capabilities"][0], "web_scraping");
        let back: SubTask = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, subtask.id);
        assert_eq!(back.dependencies, subtask.dependencies);
        assert_eq!(back.priority, 7);
    }

    #[test]
    fn new_subtask_result_optional_fields() {
        let json = serde_json::json!({
            "task_id": "00000000-0000-0000-0000-000000000001",
            "subtask_id": "st-1",
            "worker_id": "worker-a",
            "outcome": "failed",
            "error": "connection refused",
            "execution_time_seconds": 0.25
        });
        let result: NewSubTaskResult = serde_json::from_value(json).unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.output.is_none());
        assert!(result.created_at.is_none());
        assert_eq!(result.error.as_deref(), Some("connection refused"));
    }
}
