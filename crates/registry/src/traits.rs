use crate::error::RegistryError;
use crate::record::{LogEntry, Severity, TaskId, TaskOutcome};

/// Write side of the event log.
///
/// An orchestration run reports progress through this trait instead of a
/// callback threaded through the pipeline. The implementation owns message
/// formatting (project prefix, timestamps) and the terminal marker.
///
/// ## Single writer
///
/// Only the run that owns a task may append to it. Once [`finish`] has been
/// called the log is sealed and further appends return
/// [`RegistryError::AlreadyFinished`].
///
/// [`finish`]: EventSink::finish
pub trait EventSink: Send + Sync {
    /// Append one entry to the task's log.
    fn append(
        &self,
        task_id: &TaskId,
        severity: Severity,
        message: &str,
    ) -> Result<LogEntry, RegistryError>;

    /// Append the terminal entry and move the task to its final status.
    /// Both happen atomically with respect to readers.
    fn finish(&self, task_id: &TaskId, outcome: TaskOutcome) -> Result<LogEntry, RegistryError>;

    fn info(&self, task_id: &TaskId, message: &str) -> Result<LogEntry, RegistryError> {
        self.append(task_id, Severity::Info, message)
    }

    fn warning(&self, task_id: &TaskId, message: &str) -> Result<LogEntry, RegistryError> {
        self.append(task_id, Severity::Warning, message)
    }

    fn error(&self, task_id: &TaskId, message: &str) -> Result<LogEntry, RegistryError> {
        self.append(task_id, Severity::Error, message)
    }

    fn success(&self, task_id: &TaskId, message: &str) -> Result<LogEntry, RegistryError> {
        self.append(task_id, Severity::Success, message)
    }
}
