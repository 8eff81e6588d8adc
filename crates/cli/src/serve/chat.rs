//! POST/DELETE /chat/{id}: questions about a task's results.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use geocore_registry::TaskId;
use serde::Deserialize;

use super::json_error;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct ChatRequest {
    message: String,
}

/// POST /chat/{id}
///
/// Assistant failures are answered with 200 and a readable message, which
/// the web client shows inline in the conversation.
pub(crate) async fn handle_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let task_id = TaskId::from(id);
    if !state.registry().contains(&task_id) {
        return json_error(StatusCode::NOT_FOUND, &format!("task not found: {}", task_id))
            .into_response();
    }
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e))
                .into_response();
        }
    };
    if request.message.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "message must not be empty").into_response();
    }

    let response = match state.chats.send(&task_id, &request.message).await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(task_id = %task_id, error = %e, "assistant request failed");
            format!("❌ Error al comunicar con Gemini: {}", e)
        }
    };
    (StatusCode::OK, Json(serde_json::json!({ "response": response }))).into_response()
}

/// DELETE /chat/{id}
pub(crate) async fn handle_clear_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let task_id = TaskId::from(id);
    let cleared = state.chats.clear(&task_id);
    let response = serde_json::json!({
        "task_id": task_id,
        "cleared": cleared,
    });
    (StatusCode::OK, Json(response)).into_response()
}
