//! GET /stream/{id}: the task log as server-sent events.
//!
//! Each event carries one log entry as JSON. The stream ends after the
//! completion marker, or when the watchdog gives up on an idle task.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use geocore_registry::{LogEntry, TaskId};

use super::json_error;
use super::state::AppState;

fn entry_event(entry: &LogEntry) -> Event {
    match Event::default().json_data(entry) {
        Ok(event) => event,
        Err(e) => Event::default().comment(format!("unserializable entry {}: {}", entry.index, e)),
    }
}

pub(crate) async fn handle_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let task_id = TaskId::from(id);
    let subscription = match state.registry().subscribe(&task_id, state.watchdog) {
        Ok(subscription) => subscription,
        Err(e) => return json_error(StatusCode::NOT_FOUND, &e.to_string()).into_response(),
    };
    tracing::debug!(task_id = %task_id, "log stream opened");

    let events = subscription
        .into_stream()
        .map(|entry| Ok::<_, Infallible>(entry_event(&entry)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
