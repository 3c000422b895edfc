//! End-to-end tests driving the axum router directly (no bound socket),
//! covering the testable properties around `/bash`, `/file`, and
//! `/list-files`: a command executed through a session is visible via
//! `list_sessions`, file writes round-trip through the HTTP layer, and path
//! confinement rejects an escape attempt at the transport boundary.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use workspace_exec::config::ServiceConfig;
use workspace_exec::editor::FileEditor;
use workspace_exec::manager::SessionManager;
use workspace_exec::server::{build_router, ServerState};

fn test_state(root: &std::path::Path) -> ServerState {
    let config = Arc::new(ServiceConfig::for_workspace(root.to_path_buf()));
    ServerState {
        manager: SessionManager::new(config.clone()),
        editor: Arc::new(FileEditor::new(root.to_path_buf())),
        config,
    }
}

async fn post_json(router: axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .oneshot(
            Request::post(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

async fn get(router: axum::Router, path: &str) -> (StatusCode, Value) {
    let response = router.oneshot(Request::get(path).body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_bash_round_trip_creates_session_and_runs_command() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    let (status, body) = post_json(router, "/bash", json!({ "command": "echo hello" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "hello");
    assert!(body["system"].as_str().unwrap().contains("Created new session"));
}

#[tokio::test]
async fn test_bash_list_sessions_reports_session_after_use() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    post_json(router.clone(), "/bash", json!({ "command": "echo hi", "session": 1 })).await;
    let (status, body) = post_json(router, "/bash", json!({ "list_sessions": true })).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["output"].as_str().unwrap().contains("Session 1"));
}

#[tokio::test]
async fn test_bash_missing_command_creates_session_when_none_exists() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    let (status, body) = post_json(router, "/bash", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["system"], "Created new session with ID: 1");
}

#[tokio::test]
async fn test_bash_missing_command_returns_400_when_session_already_exists() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    post_json(router.clone(), "/bash", json!({ "command": "echo hi", "session": 1 })).await;
    let (status, _body) = post_json(router, "/bash", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_file_write_then_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    let (status, _) = post_json(
        router.clone(),
        "/file",
        json!({ "command": "write", "path": "notes.txt", "content": "hello world" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(
        router,
        "/file",
        json!({ "command": "read", "path": "notes.txt", "line_numbers": false }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "hello world");
}

#[tokio::test]
async fn test_file_replace_then_undo_round_trip() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    post_json(router.clone(), "/file", json!({ "command": "write", "path": "a.txt", "content": "v1" })).await;
    post_json(
        router.clone(),
        "/file",
        json!({ "command": "replace", "path": "a.txt", "old_str": "v1", "new_str": "v2" }),
    )
    .await;

    let (status, _) = post_json(router.clone(), "/file", json!({ "command": "undo", "path": "a.txt" })).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = post_json(
        router,
        "/file",
        json!({ "command": "read", "path": "a.txt", "line_numbers": false }),
    )
    .await;
    assert_eq!(body["output"], "v1");
}

#[tokio::test]
async fn test_file_path_escape_is_rejected() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    let (status, _body) =
        post_json(router, "/file", json!({ "command": "read", "path": "../../etc/passwd" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_files_excludes_dotfiles_and_readme() {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(dir.path().join("README.md"), "x").await.unwrap();
    tokio::fs::write(dir.path().join(".env"), "x").await.unwrap();
    tokio::fs::write(dir.path().join("main.rs"), "x").await.unwrap();

    let router = build_router(test_state(dir.path()));
    let (status, body) = get(router, "/list-files").await;

    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["relative_path"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"main.rs"));
    assert!(!names.contains(&"README.md"));
    assert!(!names.contains(&".env"));
}

#[tokio::test]
async fn test_status_endpoint_reports_ok() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));
    let (status, body) = get(router, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_independent_sessions_do_not_block_each_other_over_http() {
    let dir = TempDir::new().unwrap();
    let router = build_router(test_state(dir.path()));

    let slow = post_json(router.clone(), "/bash", json!({ "command": "sleep 0.2 && echo slow", "session": 1 }));
    let fast = post_json(router, "/bash", json!({ "command": "echo fast", "session": 2 }));

    let ((slow_status, slow_body), (fast_status, fast_body)) = tokio::join!(slow, fast);
    assert_eq!(fast_status, StatusCode::OK);
    assert_eq!(fast_body["output"], "fast");
    assert_eq!(slow_status, StatusCode::OK);
    assert_eq!(slow_body["output"], "slow");
}
