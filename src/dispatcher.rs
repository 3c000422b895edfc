//! Request/response shapes for `/bash` and `/file`, and the dispatch logic
//! translating a decoded request into a call against the session manager or
//! file editor. Both endpoints accept a flat JSON object where unused
//! fields are simply ignored, and every command maps onto exactly one
//! underlying operation.

use crate::editor::FileEditor;
use crate::error::ServiceError;
use crate::manager::SessionManager;
use crate::result::ToolResult;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BashRequest {
    pub command: Option<String>,
    pub session: Option<u32>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub list_sessions: bool,
    pub check_session: Option<u32>,
    pub timeout: Option<f64>,
}

/// Dispatches a decoded `/bash` request in priority order: `list_sessions`,
/// then `check_session`, then `restart`, then `command`.
pub async fn dispatch_bash(
    manager: &SessionManager,
    request: BashRequest,
) -> Result<ToolResult, ServiceError> {
    if request.list_sessions {
        return Ok(manager.list_sessions().await);
    }

    if let Some(check_session) = request.check_session {
        return Ok(manager.check_session(check_session).await);
    }

    if request.restart {
        let session_id = request.session.unwrap_or(1);
        return Ok(manager.restart(session_id).await);
    }

    match request.command {
        Some(command) => manager.execute(request.session, &command, request.timeout).await,
        None => {
            let session_id = request.session.unwrap_or(1);
            if manager.ensure_session_created(session_id).await? {
                Ok(ToolResult::system(format!("Created new session with ID: {session_id}")))
            } else {
                Err(ServiceError::InvalidArguments("no command provided.".into()))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileRequest {
    pub command: String,
    pub path: Option<String>,
    pub content: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub line_numbers: Option<bool>,
    #[serde(default)]
    pub recursive: bool,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub view_range: Option<(i64, i64)>,
    pub old_str: Option<String>,
    pub new_str: Option<String>,
    #[serde(default)]
    pub all_occurrences: bool,
    pub line: Option<i64>,
    pub text: Option<String>,
    pub lines: Option<Vec<i64>>,
    pub pattern: Option<String>,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

fn default_mode() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

fn required_path(request: &FileRequest) -> Result<&str, ServiceError> {
    request
        .path
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidArguments("'path' is required".into()))
}

fn required_content(request: &FileRequest) -> Result<&str, ServiceError> {
    request
        .content
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidArguments("'content' is required".into()))
}

fn required_src_dst(request: &FileRequest) -> Result<(&str, &str), ServiceError> {
    let src = request
        .src
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidArguments("'src' is required".into()))?;
    let dst = request
        .dst
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidArguments("'dst' is required".into()))?;
    Ok((src, dst))
}

/// Dispatches a decoded `/file` request onto [`FileEditor`].
pub async fn dispatch_file(editor: &FileEditor, request: FileRequest) -> Result<ToolResult, ServiceError> {
    let binary = match request.mode.as_str() {
        "text" => false,
        "binary" => true,
        other => return Err(ServiceError::InvalidMode(format!("choose 'text' or 'binary', got '{other}'"))),
    };
    let line_numbers = request.line_numbers.unwrap_or(true);

    match request.command.as_str() {
        "read" => editor.read(required_path(&request)?, binary, line_numbers).await,
        "write" => editor.write(required_path(&request)?, required_content(&request)?, binary).await,
        "append" => editor.append(required_path(&request)?, required_content(&request)?, binary).await,
        "delete" => editor.delete(required_path(&request)?, request.recursive).await,
        "exists" => editor.exists(required_path(&request)?).await,
        "list" => editor.list_dir(required_path(&request)?).await,
        "mkdir" => editor.mkdir(required_path(&request)?).await,
        "rmdir" => editor.rmdir(required_path(&request)?).await,
        "move" => {
            let (src, dst) = required_src_dst(&request)?;
            editor.mv(src, dst).await
        }
        "copy" => {
            let (src, dst) = required_src_dst(&request)?;
            editor.copy(src, dst).await
        }
        "view" => editor.view(required_path(&request)?, request.view_range, line_numbers).await,
        "create" => editor.create(required_path(&request)?, required_content(&request)?, binary).await,
        "replace" => {
            let path = required_path(&request)?;
            let old_str = request
                .old_str
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidArguments("'old_str' is required".into()))?;
            let new_str = request.new_str.as_deref().unwrap_or("");
            editor.replace(path, old_str, new_str, request.all_occurrences).await
        }
        "insert" => {
            let path = required_path(&request)?;
            let line = request
                .line
                .ok_or_else(|| ServiceError::InvalidArguments("'line' is required".into()))?;
            let text = request.text.as_deref().unwrap_or("");
            editor.insert(path, line, text).await
        }
        "delete_lines" => {
            let path = required_path(&request)?;
            let lines = request
                .lines
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidArguments("'lines' is required".into()))?;
            editor.delete_lines(path, lines).await
        }
        "undo" => editor.undo(required_path(&request)?).await,
        "grep" => {
            let path = required_path(&request)?;
            let pattern = request
                .pattern
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidArguments("'pattern' is required".into()))?;
            editor.grep(pattern, path, request.case_sensitive, request.recursive, line_numbers).await
        }
        other => Err(ServiceError::InvalidArguments(format!(
            "unsupported command '{other}'. supported commands: read, write, append, delete, exists, list, mkdir, rmdir, move, copy, view, create, replace, insert, delete_lines, undo, grep"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(crate::config::ServiceConfig::for_workspace(
            std::env::temp_dir(),
        )))
    }

    #[tokio::test]
    async fn dispatch_bash_without_command_creates_session_when_absent() {
        let m = manager();
        let result = dispatch_bash(&m, BashRequest::default()).await.unwrap();
        assert_eq!(result.system.as_deref(), Some("Created new session with ID: 1"));
    }

    #[tokio::test]
    async fn dispatch_bash_without_command_errors_when_session_already_exists() {
        let m = manager();
        dispatch_bash(&m, BashRequest::default()).await.unwrap();

        let err = dispatch_bash(&m, BashRequest::default()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn dispatch_bash_runs_command() {
        let m = manager();
        let request = BashRequest {
            command: Some("echo hi".into()),
            ..Default::default()
        };
        let result = dispatch_bash(&m, request).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn dispatch_file_write_then_read() {
        let dir = TempDir::new().unwrap();
        let editor = FileEditor::new(dir.path().to_path_buf());

        let write_request = FileRequest {
            command: "write".into(),
            path: Some("a.txt".into()),
            content: Some("hello".into()),
            mode: "text".into(),
            line_numbers: None,
            recursive: false,
            src: None,
            dst: None,
            view_range: None,
            old_str: None,
            new_str: None,
            all_occurrences: false,
            line: None,
            text: None,
            lines: None,
            pattern: None,
            case_sensitive: true,
        };
        dispatch_file(&editor, write_request).await.unwrap();

        let read_request = FileRequest {
            command: "read".into(),
            path: Some("a.txt".into()),
            content: None,
            mode: "text".into(),
            line_numbers: Some(false),
            recursive: false,
            src: None,
            dst: None,
            view_range: None,
            old_str: None,
            new_str: None,
            all_occurrences: false,
            line: None,
            text: None,
            lines: None,
            pattern: None,
            case_sensitive: true,
        };
        let result = dispatch_file(&editor, read_request).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn dispatch_file_unsupported_command_errors() {
        let dir = TempDir::new().unwrap();
        let editor = FileEditor::new(dir.path().to_path_buf());
        let request = FileRequest {
            command: "frobnicate".into(),
            path: None,
            content: None,
            mode: "text".into(),
            line_numbers: None,
            recursive: false,
            src: None,
            dst: None,
            view_range: None,
            old_str: None,
            new_str: None,
            all_occurrences: false,
            line: None,
            text: None,
            lines: None,
            pattern: None,
            case_sensitive: true,
        };
        let err = dispatch_file(&editor, request).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArguments(_)));
    }
}
