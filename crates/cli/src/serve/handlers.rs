//! Core HTTP route handlers: health, submission, task state, logs, download.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use geocore_core::parse_references;
use geocore_registry::{RegistryError, TaskId, TaskStatus};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::json_error;
use super::state::AppState;

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

// ── Submission ───────────────────────────────────────────────────────────────

/// Start a task and answer with its id before any reference is processed.
fn accept(state: &AppState, project: &str, references: Vec<String>) -> Response {
    let ref_count = references.len();
    let task_id = state.orchestrator.submit(project, references);
    tracing::info!(task_id = %task_id, project, ref_count, "task submitted");
    let response = serde_json::json!({
        "task_id": task_id,
        "project_name": project,
        "ref_count": ref_count,
    });
    (StatusCode::OK, Json(response)).into_response()
}

/// Read the `file` field of a multipart upload: project label (the file
/// name) and its references.
async fn read_upload(multipart: &mut Multipart) -> Result<(String, Vec<String>), Response> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid multipart body: {}", e),
                )
                .into_response());
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let project = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "referencias.txt".to_string());
        let bytes = field.bytes().await.map_err(|e| {
            json_error(
                StatusCode::BAD_REQUEST,
                &format!("failed to read upload: {}", e),
            )
            .into_response()
        })?;
        let text = std::str::from_utf8(&bytes).map_err(|_| {
            json_error(StatusCode::BAD_REQUEST, "reference file must be UTF-8").into_response()
        })?;
        return Ok((project, parse_references(text)));
    }

    Err(json_error(StatusCode::BAD_REQUEST, "missing 'file' field").into_response())
}

/// POST /upload
///
/// Multipart form with one `file` field holding newline-delimited
/// references. The uploaded file name becomes the project label.
pub(crate) async fn handle_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    match read_upload(&mut multipart).await {
        Ok((project, references)) => accept(&state, &project, references),
        Err(response) => response,
    }
}

/// Reference list of a JSON submission: an array or one newline-delimited string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ReferenceList {
    List(Vec<String>),
    Text(String),
}

impl ReferenceList {
    fn into_references(self) -> Vec<String> {
        match self {
            ReferenceList::List(list) => list
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            ReferenceList::Text(text) => parse_references(&text),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitRequest {
    #[serde(default)]
    project: Option<String>,
    references: ReferenceList,
}

/// POST /tasks
pub(crate) async fn handle_submit(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Response {
    let request: SubmitRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e))
                .into_response();
        }
    };
    let project = request
        .project
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| "proyecto".to_string());
    accept(&state, &project, request.references.into_references())
}

/// POST /process-sync
///
/// Same upload as `/upload`, but the response is held until the task ends:
/// `{success, task_id, download_url, file_size, error}`.
pub(crate) async fn handle_process_sync(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let (project, references) = match read_upload(&mut multipart).await {
        Ok(upload) => upload,
        Err(response) => return response,
    };
    let task_id = state.orchestrator.submit(&project, references);
    tracing::info!(task_id = %task_id, project = %project, "synchronous task submitted");

    let mut subscription = match state.registry().subscribe(&task_id, state.watchdog) {
        Ok(subscription) => subscription,
        Err(e) => return registry_error(&e),
    };
    let mut last = None;
    while let Some(entry) = subscription.next().await {
        last = Some(entry);
    }

    let snapshot = match state.registry().snapshot(&task_id) {
        Ok(snapshot) => snapshot,
        Err(e) => return registry_error(&e),
    };
    let response = match snapshot.status {
        TaskStatus::Completed => {
            let file_size = match &snapshot.archive {
                Some(path) => tokio::fs::metadata(path)
                    .await
                    .map(|meta| human_size(meta.len()))
                    .ok(),
                None => None,
            };
            serde_json::json!({
                "success": true,
                "task_id": task_id,
                "download_url": snapshot.result_url,
                "file_size": file_size,
                "error": null,
            })
        }
        status => {
            let error = match (status, last) {
                (TaskStatus::Processing, _) => "task still running".to_string(),
                (_, Some(entry)) => entry.message,
                (_, None) => "task failed".to_string(),
            };
            serde_json::json!({
                "success": false,
                "task_id": task_id,
                "download_url": null,
                "file_size": null,
                "error": error,
            })
        }
    };
    (StatusCode::OK, Json(response)).into_response()
}

fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f < KB {
        format!("{} B", bytes)
    } else if bytes_f < KB * KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{:.1} MB", bytes_f / (KB * KB))
    }
}

// ── Task state ───────────────────────────────────────────────────────────────

fn registry_error(e: &RegistryError) -> Response {
    let status = match e {
        RegistryError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::AlreadyFinished { .. } => StatusCode::CONFLICT,
    };
    json_error(status, &e.to_string()).into_response()
}

/// GET /tasks
pub(crate) async fn handle_list(State(state): State<Arc<AppState>>) -> Response {
    let tasks = state.registry().list();
    (StatusCode::OK, Json(serde_json::json!({ "tasks": tasks }))).into_response()
}

/// GET /tasks/{id}
pub(crate) async fn handle_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.registry().snapshot(&TaskId::from(id)) {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => registry_error(&e),
    }
}

/// DELETE /tasks/{id}
pub(crate) async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let task_id = TaskId::from(id);
    match state.orchestrator.cancel(&task_id) {
        Ok(()) => {
            let response = serde_json::json!({
                "task_id": task_id,
                "status": "cancelling",
            });
            (StatusCode::ACCEPTED, Json(response)).into_response()
        }
        Err(e) => registry_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogsQuery {
    #[serde(default)]
    since: usize,
}

/// GET /logs/{id}?since=N
pub(crate) async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.registry().poll(&TaskId::from(id), query.since) {
        Ok(batch) => (StatusCode::OK, Json(batch)).into_response(),
        Err(e) => registry_error(&e),
    }
}

// ── Download ─────────────────────────────────────────────────────────────────

/// GET /download/{id}
pub(crate) async fn handle_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let task_id = TaskId::from(id);
    let archive = match state.registry().archive(&task_id) {
        Ok(Some(path)) => path,
        Ok(None) => {
            return json_error(StatusCode::NOT_FOUND, "result archive not available yet")
                .into_response();
        }
        Err(e) => return registry_error(&e),
    };

    let file = match tokio::fs::File::open(&archive).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(task_id = %task_id, path = %archive.display(), error = %e, "archive missing on disk");
            return json_error(StatusCode::NOT_FOUND, "result archive not found").into_response();
        }
    };

    let disposition = format!("attachment; filename=\"{}_resultados.zip\"", task_id);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}
