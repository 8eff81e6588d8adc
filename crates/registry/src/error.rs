use crate::record::{TaskId, TaskStatus};

/// All errors that can be returned by the task registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No task with the given id exists (never issued, or already evicted).
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// The task already reached a terminal status; its log is sealed.
    #[error("task {task_id} already finished with status {status}")]
    AlreadyFinished { task_id: TaskId, status: TaskStatus },
}
