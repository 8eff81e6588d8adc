//! `geocore serve` -- HTTP JSON API for batch cadastral processing.
//!
//! Submissions return a task id immediately; the batch itself runs on a
//! background task and its log is read by polling or by the SSE stream.
//!
//! Endpoints:
//! - GET    /health          - Server status
//! - POST   /upload          - Multipart reference list (field `file`)
//! - POST   /process-sync    - Multipart upload, answered when the task ends
//! - GET    /tasks           - Snapshots of every registered task
//! - POST   /tasks           - JSON reference list
//! - GET    /tasks/{id}      - Task snapshot
//! - DELETE /tasks/{id}      - Request cancellation
//! - GET    /logs/{id}       - Poll log entries (`?since=N`)
//! - GET    /stream/{id}     - Server-sent events, one per log entry
//! - GET    /download/{id}   - Result archive
//! - POST   /chat/{id}       - Ask the assistant about a task
//! - DELETE /chat/{id}       - Forget the conversation
//!
//! All responses except the archive and the event stream are JSON.

mod chat;
mod handlers;
mod state;
mod stream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use geocore_core::{
    assistant_from_env, ChatSessions, PipelineConfig, ResultPackager, TaskOrchestrator,
};
use geocore_registry::{TaskRegistry, Watchdog};
use tower_http::cors::{Any, CorsLayer};

use self::chat::{handle_chat, handle_clear_chat};
use self::handlers::{
    handle_cancel, handle_download, handle_health, handle_list, handle_logs, handle_not_found,
    handle_process_sync, handle_submit, handle_task, handle_upload,
};
use self::state::AppState;
use self::stream::handle_stream;

/// Maximum request body size: 10 MB.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Server knobs that are not part of the pipeline itself.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Finished tasks older than this are dropped from the registry.
    /// `None` keeps every task for the life of the process.
    pub retention: Option<Duration>,
    pub watchdog: Watchdog,
}

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

fn router(state: Arc<AppState>) -> Router {
    // Permissive: the web client is served from a different origin in development.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload))
        .route("/process-sync", post(handle_process_sync))
        .route("/tasks", get(handle_list).post(handle_submit))
        .route("/tasks/{id}", get(handle_task).delete(handle_cancel))
        .route("/logs/{id}", get(handle_logs))
        .route("/stream/{id}", get(handle_stream))
        .route("/download/{id}", get(handle_download))
        .route("/chat/{id}", post(handle_chat).delete(handle_clear_chat))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the HTTP server on the given port.
pub async fn start_server(
    port: u16,
    config: PipelineConfig,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    tokio::fs::create_dir_all(&config.output_root).await?;
    if !config.layer_root.is_dir() {
        eprintln!(
            "Warning: layer directory {} not found; intersections will be skipped",
            config.layer_root.display()
        );
    }
    eprintln!("Cadastral feed: {}", config.feed_url);
    eprintln!("Output directory: {}", config.output_root.display());
    eprintln!(
        "Concurrent tasks: {} (further submissions queue)",
        config.max_concurrent_tasks
    );

    let registry = Arc::new(TaskRegistry::new());
    let chats = ChatSessions::new(assistant_from_env(), config.output_root.clone());
    let outputs = ResultPackager::new(config.output_root.clone());
    let orchestrator = Arc::new(TaskOrchestrator::from_config(config, registry));

    eprintln!(
        "Event streams close after {}s without a new entry",
        options.watchdog.max_idle().as_secs()
    );
    let state = Arc::new(AppState {
        orchestrator,
        chats,
        outputs,
        watchdog: options.watchdog,
    });

    if let Some(retention) = options.retention {
        eprintln!("Finished tasks are kept for {}s", retention.as_secs());
        tokio::spawn(evict_periodically(Arc::clone(&state), retention));
    }

    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("GEOCORE listening on http://0.0.0.0:{}", port);
    tracing::info!(port, "server started");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    eprintln!("\nServer shut down.");
    Ok(())
}

async fn evict_periodically(state: Arc<AppState>, retention: Duration) {
    let period = (retention / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        sweep(&state, retention).await;
    }
}

/// Evict expired tasks together with their conversations and output files.
/// Returns the number of tasks evicted.
async fn sweep(state: &AppState, retention: Duration) -> usize {
    let evicted = state.registry().evict_finished(retention);
    for task_id in &evicted {
        state.chats.clear(task_id);
        if let Err(e) = state.outputs.discard(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "could not delete task outputs");
        }
    }
    if !evicted.is_empty() {
        tracing::debug!(evicted = evicted.len(), "released evicted task outputs");
    }
    evicted.len()
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Warning: could not listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    eprintln!("\nReceived shutdown signal...");
}
