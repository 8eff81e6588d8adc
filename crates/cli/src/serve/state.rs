//! Application state.

use std::sync::Arc;

use geocore_core::{ChatSessions, ResultPackager, TaskOrchestrator};
use geocore_registry::{TaskRegistry, Watchdog};

/// Application state shared across request handlers.
pub(crate) struct AppState {
    /// Runs submitted batches and owns the task registry.
    pub(crate) orchestrator: Arc<TaskOrchestrator>,
    /// One assistant conversation per task.
    pub(crate) chats: ChatSessions,
    /// Output areas and archives, released when a task is evicted.
    pub(crate) outputs: ResultPackager,
    /// Idle budget of each `/stream` subscription.
    pub(crate) watchdog: Watchdog,
}

impl AppState {
    pub(crate) fn registry(&self) -> &Arc<TaskRegistry> {
        self.orchestrator.registry()
    }
}
