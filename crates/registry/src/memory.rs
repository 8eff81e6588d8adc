//! In-memory [`TaskRegistry`].
//!
//! Tasks live in a `DashMap` so lookups from many readers never contend on a
//! global lock. Each task keeps its mutable state behind its own `RwLock`,
//! which is only held for the duration of a copy and never across an await.
//! A `watch` channel per task carries the current log length so subscribers
//! wake up on every append.

use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::error::RegistryError;
use crate::marker;
use crate::record::{
    LogEntry, PollBatch, Severity, TaskId, TaskOutcome, TaskSnapshot, TaskStatus,
};
use crate::subscription::{LogSubscription, Watchdog};
use crate::traits::EventSink;

/// Mutable part of a task, guarded by the cell's lock.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) status: TaskStatus,
    pub(crate) entries: Vec<LogEntry>,
    archive: Option<PathBuf>,
    result_url: Option<String>,
    finished_at: Option<OffsetDateTime>,
}

/// One registered task.
#[derive(Debug)]
pub(crate) struct TaskCell {
    project: String,
    references: Vec<String>,
    created_at: OffsetDateTime,
    state: RwLock<TaskState>,
    appended: watch::Sender<usize>,
}

impl TaskCell {
    fn new(project: String, references: Vec<String>) -> Self {
        let (appended, _) = watch::channel(0);
        TaskCell {
            project,
            references,
            created_at: OffsetDateTime::now_utc(),
            state: RwLock::new(TaskState {
                status: TaskStatus::Processing,
                entries: Vec::new(),
                archive: None,
                result_url: None,
                finished_at: None,
            }),
            appended,
        }
    }

    // A poisoned lock only means a writer panicked between two appends; the
    // log itself is still a valid prefix, so readers keep going.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, TaskState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TaskState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True when the first `delivered` entries end with the entry written by
    /// `finish`. Status and marker are set under one write lock, so a
    /// marker-looking phrase in user text never satisfies both.
    pub(crate) fn is_complete(&self, state: &TaskState, delivered: usize) -> bool {
        state.status.is_terminal()
            && delivered == state.entries.len()
            && marker::is_terminal_entry(&self.project, &state.entries)
    }

    pub(crate) fn watch(&self) -> watch::Receiver<usize> {
        self.appended.subscribe()
    }

    fn push(&self, state: &mut TaskState, severity: Severity, message: &str) -> LogEntry {
        let now = OffsetDateTime::now_utc();
        let entry = LogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            index: state.entries.len(),
            timestamp: clock_time(now),
            message: format!("[{}] {}", self.project, message),
            severity,
        };
        state.entries.push(entry.clone());
        self.appended.send_replace(state.entries.len());
        entry
    }

    fn snapshot(&self, task_id: &TaskId) -> TaskSnapshot {
        let state = self.read();
        TaskSnapshot {
            task_id: task_id.clone(),
            project: self.project.clone(),
            references: self.references.clone(),
            status: state.status,
            log_len: state.entries.len(),
            result_url: state.result_url.clone(),
            archive: state.archive.clone(),
            created_at: rfc3339(self.created_at),
            finished_at: state.finished_at.map(rfc3339),
        }
    }
}

fn clock_time(at: OffsetDateTime) -> String {
    let format = time::macros::format_description!("[hour]:[minute]:[second]");
    at.format(&format).unwrap_or_else(|_| "--:--:--".to_string())
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Concurrent-safe store of every task's status and log.
///
/// Created once at process start and shared behind an `Arc`. State is
/// transient; nothing survives a restart.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskCell>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task in `processing` status and return its id.
    pub fn create(&self, project: &str, references: Vec<String>) -> TaskId {
        let task_id = TaskId::generate();
        let cell = Arc::new(TaskCell::new(project.to_string(), references));
        self.tasks.insert(task_id.clone(), cell);
        tracing::debug!(task_id = %task_id, project, "task registered");
        task_id
    }

    fn cell(&self, task_id: &TaskId) -> Result<Arc<TaskCell>, RegistryError> {
        self.tasks
            .get(task_id)
            .map(|cell| Arc::clone(cell.value()))
            .ok_or_else(|| RegistryError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn snapshot(&self, task_id: &TaskId) -> Result<TaskSnapshot, RegistryError> {
        Ok(self.cell(task_id)?.snapshot(task_id))
    }

    /// Snapshots of every registered task, oldest first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut cells: Vec<(TaskId, Arc<TaskCell>)> = self
            .tasks
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();
        cells.sort_by_key(|(_, cell)| cell.created_at);
        cells
            .iter()
            .map(|(task_id, cell)| cell.snapshot(task_id))
            .collect()
    }

    pub fn status(&self, task_id: &TaskId) -> Result<TaskStatus, RegistryError> {
        Ok(self.cell(task_id)?.read().status)
    }

    /// Copy of the whole log.
    pub fn entries(&self, task_id: &TaskId) -> Result<Vec<LogEntry>, RegistryError> {
        Ok(self.cell(task_id)?.read().entries.clone())
    }

    /// Path of the packaged archive, once the task completed.
    pub fn archive(&self, task_id: &TaskId) -> Result<Option<PathBuf>, RegistryError> {
        Ok(self.cell(task_id)?.read().archive.clone())
    }

    /// Entries appended at or after `since`, plus the completion flag.
    ///
    /// Reads have no side effects: polling the same index twice returns the
    /// same entries, and every batch extends the previous ones in order.
    pub fn poll(&self, task_id: &TaskId, since: usize) -> Result<PollBatch, RegistryError> {
        let cell = self.cell(task_id)?;
        let state = cell.read();
        let start = since.min(state.entries.len());
        Ok(PollBatch {
            logs: state.entries[start..].to_vec(),
            next_index: state.entries.len(),
            completed: cell.is_complete(&state, state.entries.len()),
            status: state.status,
            result_url: state.result_url.clone(),
        })
    }

    /// Live view of the log from its first entry, ending after the terminal
    /// entry or when the watchdog budget runs out.
    pub fn subscribe(
        &self,
        task_id: &TaskId,
        watchdog: Watchdog,
    ) -> Result<LogSubscription, RegistryError> {
        let cell = self.cell(task_id)?;
        Ok(LogSubscription::new(cell, watchdog))
    }

    /// Drop finished tasks whose completion is older than `retention`.
    /// Running tasks are never evicted. Returns the ids removed so callers
    /// can release whatever else they keep per task.
    pub fn evict_finished(&self, retention: Duration) -> Vec<TaskId> {
        let now = OffsetDateTime::now_utc();
        let mut removed = Vec::new();
        self.tasks.retain(|task_id, cell| {
            let state = cell.read();
            let keep = match state.finished_at {
                Some(finished) if state.status.is_terminal() => {
                    let age = now - finished;
                    age.whole_milliseconds() < retention.as_millis() as i128
                }
                _ => true,
            };
            if !keep {
                removed.push(task_id.clone());
            }
            keep
        });
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "evicted finished tasks");
        }
        removed
    }
}

impl EventSink for TaskRegistry {
    fn append(
        &self,
        task_id: &TaskId,
        severity: Severity,
        message: &str,
    ) -> Result<LogEntry, RegistryError> {
        let cell = self.cell(task_id)?;
        let mut state = cell.write();
        if state.status.is_terminal() {
            return Err(RegistryError::AlreadyFinished {
                task_id: task_id.clone(),
                status: state.status,
            });
        }
        Ok(cell.push(&mut state, severity, message))
    }

    fn finish(&self, task_id: &TaskId, outcome: TaskOutcome) -> Result<LogEntry, RegistryError> {
        let cell = self.cell(task_id)?;
        let mut state = cell.write();
        if state.status.is_terminal() {
            return Err(RegistryError::AlreadyFinished {
                task_id: task_id.clone(),
                status: state.status,
            });
        }

        let entry = match outcome {
            TaskOutcome::Completed {
                archive,
                result_url,
            } => {
                let entry = cell.push(
                    &mut state,
                    Severity::Success,
                    &marker::success_message(&result_url),
                );
                state.status = TaskStatus::Completed;
                state.archive = Some(archive);
                state.result_url = Some(result_url);
                entry
            }
            TaskOutcome::Failed { reason } => {
                let entry = cell.push(
                    &mut state,
                    Severity::Error,
                    &marker::failure_message(&reason),
                );
                state.status = TaskStatus::Failed;
                entry
            }
        };
        state.finished_at = Some(OffsetDateTime::now_utc());
        tracing::info!(task_id = %task_id, status = %state.status, "task finished");
        Ok(entry)
    }
}
