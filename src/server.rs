//! HTTP/WebSocket transport: the axum `Router` wiring every external
//! interface onto the session manager and file editor.

use crate::config::ServiceConfig;
use crate::dispatcher::{self, BashRequest, FileRequest};
use crate::editor::FileEditor;
use crate::error::ServiceError;
use crate::manager::SessionManager;
use crate::session::StreamChunk;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ServerState {
    pub manager: SessionManager,
    pub editor: Arc<FileEditor>,
    pub config: Arc<ServiceConfig>,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/bash", post(bash_action))
        .route("/bash/ws", get(bash_websocket))
        .route("/file", post(file_action))
        .route("/list-files", get(list_files))
        .route("/file/{*path}", get(get_file))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct EndpointDescription {
    path: &'static str,
    method: &'static str,
    description: &'static str,
}

async fn root() -> Json<serde_json::Value> {
    let endpoints = [
        EndpointDescription { path: "/bash", method: "POST", description: "Execute bash commands" },
        EndpointDescription {
            path: "/file",
            method: "POST",
            description: "File operations (read, write, create, delete, etc.)",
        },
        EndpointDescription { path: "/status", method: "GET", description: "Check service status" },
        EndpointDescription {
            path: "/list-files",
            method: "GET",
            description: "List all files and directories in the workspace",
        },
        EndpointDescription { path: "/file/{file_path}", method: "GET", description: "Get a specific file" },
        EndpointDescription { path: "/bash/ws", method: "GET", description: "Live bash output over WebSocket" },
    ];
    Json(serde_json::json!({
        "service": "workspace-exec",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
    }))
}

async fn status() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "workspace-exec" }))
}

fn tool_error_response(e: ServiceError) -> Response {
    let status = e.status_code();
    (status, Json(serde_json::json!({ "detail": e.to_string() }))).into_response()
}

async fn bash_action(
    State(state): State<ServerState>,
    Json(request): Json<BashRequest>,
) -> Response {
    match dispatcher::dispatch_bash(&state.manager, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => tool_error_response(e),
    }
}

async fn file_action(
    State(state): State<ServerState>,
    Json(request): Json<FileRequest>,
) -> Response {
    match dispatcher::dispatch_file(&state.editor, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => tool_error_response(e),
    }
}

#[derive(Deserialize)]
struct ListFilesQuery {
    #[serde(default)]
    git_ignore: bool,
}

async fn list_files(State(state): State<ServerState>, Query(query): Query<ListFilesQuery>) -> Response {
    match crate::lister::list_workspace(&state.config.workspace_root, query.git_ignore, &state.config.exclusion_patterns)
        .await
    {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "detail": format!("Error listing files: {e}") })),
        )
            .into_response(),
    }
}

async fn get_file(State(state): State<ServerState>, AxumPath(file_path): AxumPath<String>) -> Response {
    let full_path = match crate::path_guard::resolve(&state.config.workspace_root, &file_path) {
        Ok(p) => p,
        Err(_) => {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "detail": "Access denied: Path outside workspace" })),
            )
                .into_response()
        }
    };

    if crate::path_guard::is_excluded(&state.config.workspace_root, &full_path, &state.config.exclusion_patterns) {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "detail": "Access denied: File is excluded from serving" })),
        )
            .into_response();
    }

    if !full_path.exists() {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "detail": "File not found" }))).into_response();
    }

    if !full_path.is_file() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": "Path is not a file" })),
        )
            .into_response();
    }

    match tokio::fs::read(&full_path).await {
        Ok(bytes) => bytes.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "detail": format!("Error reading file: {e}") })),
        )
            .into_response(),
    }
}

async fn bash_websocket(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_bash_socket(socket, state))
}

/// Drives a dedicated session for the lifetime of one WebSocket connection:
/// each received text frame is run as a streamed command, chunks are pumped
/// back as text frames, and the session is torn down on disconnect.
async fn handle_bash_socket(socket: WebSocket, state: ServerState) {
    let session_id = state.manager.allocate_websocket_session_id().await;
    if let Err(e) = state.manager.ensure_session(session_id).await {
        warn!(session = session_id, error = %e, "failed to start websocket session");
        return;
    }
    info!(session = session_id, "websocket session started");

    let (mut sender, mut receiver) = socket.split();

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let command = text.trim();
        if command.is_empty() {
            continue;
        }

        match state.manager.start_stream(session_id, command).await {
            Ok(mut rx) => {
                while let Some(chunk) = rx.recv().await {
                    let text = match chunk {
                        StreamChunk::Stdout(s) | StreamChunk::Stderr(s) => s,
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                state.manager.finish_stream(session_id).await;
            }
            Err(e) => {
                let _ = sender.send(Message::Text(format!("ERROR: {e}\n").into())).await;
            }
        }
    }

    state.manager.close_session(session_id).await;
    info!(session = session_id, "websocket session closed");
}
