use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::watch;

use crate::memory::TaskCell;
use crate::record::LogEntry;

/// Bounds how long a subscriber may wait without seeing the task finish.
///
/// Every `poll_interval` spent waiting without a new entry counts as one
/// iteration; after `max_polls` iterations the subscription ends even if the
/// task is still running, so an abandoned or stalled task cannot hold a
/// connection open forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Watchdog {
    pub fn new(poll_interval: Duration, max_polls: u32) -> Self {
        Watchdog {
            poll_interval,
            max_polls,
        }
    }

    /// Upper bound on the time a subscription can stay idle.
    pub fn max_idle(&self) -> Duration {
        self.poll_interval * self.max_polls
    }
}

impl Default for Watchdog {
    /// Half-second wake-ups for at most one hour.
    fn default() -> Self {
        Watchdog::new(Duration::from_millis(500), 7200)
    }
}

/// Live, ordered view of one task's log.
///
/// Yields every entry exactly once in append order, starting from the first,
/// and ends after the terminal entry (same check as polling) or when the
/// watchdog expires.
pub struct LogSubscription {
    cell: Arc<TaskCell>,
    appended: watch::Receiver<usize>,
    cursor: usize,
    polls: u32,
    watchdog: Watchdog,
    done: bool,
}

impl LogSubscription {
    pub(crate) fn new(cell: Arc<TaskCell>, watchdog: Watchdog) -> Self {
        let appended = cell.watch();
        LogSubscription {
            cell,
            appended,
            cursor: 0,
            polls: 0,
            watchdog,
            done: false,
        }
    }

    /// Number of entries delivered so far.
    pub fn delivered(&self) -> usize {
        self.cursor
    }

    /// True once the subscription has stopped, by completion or watchdog.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next entry, waiting for it if necessary. `None` ends the stream.
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if self.done {
                return None;
            }

            {
                let state = self.cell.read();
                if self.cursor < state.entries.len() {
                    let entry = state.entries[self.cursor].clone();
                    self.cursor += 1;
                    if self.cell.is_complete(&state, self.cursor) {
                        self.done = true;
                    }
                    return Some(entry);
                }
            }

            if self.polls >= self.watchdog.max_polls {
                tracing::debug!(delivered = self.cursor, "log subscription watchdog expired");
                self.done = true;
                return None;
            }

            // The cell owns the sender, so `changed` can only time out here.
            let waited =
                tokio::time::timeout(self.watchdog.poll_interval, self.appended.changed()).await;
            if waited.is_err() {
                self.polls += 1;
            }
        }
    }

    /// Adapt into a `futures` stream (used by the SSE endpoint).
    pub fn into_stream(self) -> impl Stream<Item = LogEntry> + Send {
        stream::unfold(self, |mut sub| async move {
            let entry = sub.next().await?;
            Some((entry, sub))
        })
    }
}
