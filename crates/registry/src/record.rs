use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque, unique task identifier (UUID v4 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Issue a fresh identifier.
    pub fn generate() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

/// Lifecycle status of a task. Moves only forward: `Processing` to one of
/// the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Processing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Severity of a log entry, rendered by clients as the entry colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Success => "success",
        };
        f.write_str(s)
    }
}

/// One immutable line of a task's progress log.
///
/// Serialized with `type` for the severity, which is the shape existing
/// web clients consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    /// Zero-based position in the task's log.
    pub index: usize,
    /// Wall-clock time of the append, `HH:MM:SS`.
    pub timestamp: String,
    pub message: String,
    #[serde(rename = "type")]
    pub severity: Severity,
}

/// How an orchestration run ended. Consumed by [`crate::EventSink::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The archive was produced and can be downloaded from `result_url`.
    Completed { archive: PathBuf, result_url: String },
    /// The run failed at the orchestration level.
    Failed { reason: String },
}

/// Read-only view of a task, safe to hand to HTTP clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub project: String,
    pub references: Vec<String>,
    pub status: TaskStatus,
    pub log_len: usize,
    pub result_url: Option<String>,
    #[serde(skip)]
    pub archive: Option<PathBuf>,
    /// RFC 3339 timestamp string.
    pub created_at: String,
    /// RFC 3339 timestamp string. None while the task is processing.
    pub finished_at: Option<String>,
}

/// Result of one poll: the entries appended since the requested index plus
/// the completion flag computed from the latest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollBatch {
    pub logs: Vec<LogEntry>,
    pub next_index: usize,
    pub completed: bool,
    pub status: TaskStatus,
    pub result_url: Option<String>,
}
