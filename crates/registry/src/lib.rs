//! Task registry and event log for GEOCORE batch runs.
//!
//! The registry is the only state shared between submissions, running
//! orchestrations and log readers. Each task has exactly one writer (its
//! orchestration run, through [`EventSink`]) and any number of readers
//! (polling through [`TaskRegistry::poll`] or streaming through
//! [`TaskRegistry::subscribe`]).

mod error;
pub mod marker;
mod memory;
mod record;
mod subscription;
mod traits;

pub use error::RegistryError;
pub use memory::TaskRegistry;
pub use record::{LogEntry, PollBatch, Severity, TaskId, TaskOutcome, TaskSnapshot, TaskStatus};
pub use subscription::{LogSubscription, Watchdog};
pub use traits::EventSink;
