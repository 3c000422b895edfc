//! Multiplexes many [`ShellSession`]s behind a map mutex: session
//! selection, restart-on-demand, and the single-shot auto-recovery that
//! reruns a command once after a corrupted session is torn down and
//! rebuilt.
//!
//! The map mutex (`sessions`) guards only the table of session handles; it
//! is never held across a session's own I/O. Each session gets its own
//! `tokio::sync::Mutex`, so two different sessions run commands fully
//! concurrently, and a command already in flight on a session is detected
//! via `try_lock` rather than by queuing up behind it — the caller gets a
//! fail-fast "session is busy, use another session number" instead of
//! blocking.

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::result::ToolResult;
use crate::session::ShellSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

type SessionHandle = Arc<Mutex<ShellSession>>;

/// Shared, cloneable handle to the session table.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<u32, SessionHandle>>>,
    config: Arc<ServiceConfig>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn new_session(&self, session_id: u32) -> ShellSession {
        ShellSession::new(
            session_id,
            self.config.workspace_root.clone(),
            self.config.stderr_filters.clone(),
        )
    }

    /// Get the handle for `session_id`, creating and starting a fresh
    /// session under it if absent. Returns whether a session was created.
    async fn get_or_create(&self, session_id: u32) -> Result<(SessionHandle, bool), ServiceError> {
        let mut table = self.sessions.lock().await;
        if let Some(handle) = table.get(&session_id) {
            return Ok((handle.clone(), false));
        }

        let mut fresh = self.new_session(session_id);
        fresh.start().await?;
        let handle = Arc::new(Mutex::new(fresh));
        table.insert(session_id, handle.clone());
        Ok((handle, true))
    }

    async fn replace(&self, session_id: u32) -> Result<SessionHandle, ServiceError> {
        let mut table = self.sessions.lock().await;
        if let Some(old) = table.get(&session_id) {
            old.lock().await.stop();
        }
        let mut fresh = self.new_session(session_id);
        fresh.start().await?;
        let handle = Arc::new(Mutex::new(fresh));
        table.insert(session_id, handle.clone());
        Ok(handle)
    }

    /// Human-readable summary of every session, matching `list_sessions`.
    pub async fn list_sessions(&self) -> ToolResult {
        let handles: Vec<(u32, SessionHandle)> = {
            let table = self.sessions.lock().await;
            let mut entries: Vec<_> = table.iter().map(|(id, h)| (*id, h.clone())).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };

        if handles.is_empty() {
            return ToolResult::system("No active sessions.");
        }

        let mut lines = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let session = handle.lock().await;
            let status = if session.is_busy() { "running command" } else { "idle" };
            let last_cmd = if session.last_command().is_empty() {
                "None"
            } else {
                session.last_command()
            };
            lines.push(format!(
                "Session {id}: {status}, Last command: '{last_cmd}', Directory: {}",
                self.config.workspace_root.display()
            ));
        }

        ToolResult::output(lines.join("\n"))
    }

    /// Poll the in-flight output of `session_id`, matching `check_session`.
    pub async fn check_session(&self, session_id: u32) -> ToolResult {
        let handle = {
            let table = self.sessions.lock().await;
            table.get(&session_id).cloned()
        };
        let Some(handle) = handle else {
            return ToolResult::error(format!("Session {session_id} not found."));
        };
        handle.lock().await.poll().await
    }

    /// Stop (if present) and recreate `session_id`, matching `restart`.
    pub async fn restart(&self, session_id: u32) -> ToolResult {
        match self.replace(session_id).await {
            Ok(_) => ToolResult::system(format!("Session {session_id} has been restarted.")),
            Err(e) => ToolResult::error(format!("Failed to restart session {session_id}: {e}")),
        }
    }

    /// Pick (or create) a session and run `command` on it, applying the
    /// single-shot auto-recovery and "created new session" annotation.
    pub async fn execute(
        &self,
        session_id: Option<u32>,
        command: &str,
        timeout_secs: Option<f64>,
    ) -> Result<ToolResult, ServiceError> {
        if command.len() > crate::config::MAX_COMMAND_BYTES {
            return Err(ServiceError::CommandTooLong {
                len: command.len(),
                max: crate::config::MAX_COMMAND_BYTES,
            });
        }

        let timeout_secs = timeout_secs.unwrap_or(self.config.default_timeout.as_secs_f64());

        let id = match session_id {
            Some(id) => id,
            None => self.first_available_session_id().await,
        };

        let (handle, created) = self.get_or_create(id).await?;
        let created_msg = created.then(|| format!("Created new session with ID: {id}"));

        let Ok(mut guard) = handle.try_lock() else {
            return Ok(ToolResult::system(format!(
                "Session {id} is busy running another command. Please use another session number."
            )));
        };

        if guard.is_busy() {
            return Ok(ToolResult::system(format!(
                "Session {id} is busy running '{}'. Please use another session number.",
                guard.last_command()
            )));
        }

        let result = guard.run(command, timeout_secs).await?;

        if needs_restart(&result) {
            warn!(session = id, "auto-recovering corrupted session");
            guard.stop();
            let mut fresh = self.new_session(id);
            fresh.start().await?;
            *guard = fresh;
            let rerun = guard.run(command, timeout_secs).await?;
            let annotated = rerun.with_system_prefix(&format!(
                "Session {id} was automatically restarted and the command was re-run."
            ));
            return Ok(annotated);
        }

        if let Some(created_msg) = created_msg {
            return Ok(result.with_system_prefix(&created_msg));
        }

        Ok(result)
    }

    async fn first_available_session_id(&self) -> u32 {
        let table = self.sessions.lock().await;
        let mut candidate = 1u32;
        loop {
            match table.get(&candidate) {
                None => return candidate,
                Some(handle) => match handle.try_lock() {
                    Ok(guard) if !guard.is_busy() => return candidate,
                    _ => candidate += 1,
                },
            }
        }
    }

    /// Begin a streaming command on `session_id` (creating it if absent).
    pub async fn start_stream(
        &self,
        session_id: u32,
        command: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<crate::session::StreamChunk>, ServiceError> {
        let (handle, created) = self.get_or_create(session_id).await?;
        if created {
            info!(session = session_id, "created new session for stream");
        }
        let mut guard = handle
            .try_lock()
            .map_err(|_| ServiceError::Busy(session_id, "another command".to_string()))?;
        guard.stream(command).await
    }

    /// Reclaim a session's pipes once its stream has finished draining.
    pub async fn finish_stream(&self, session_id: u32) {
        let handle = {
            let table = self.sessions.lock().await;
            table.get(&session_id).cloned()
        };
        if let Some(handle) = handle {
            handle.lock().await.finish_stream().await;
        }
    }

    /// Pick a fresh session id one past the highest currently in use,
    /// matching the WebSocket endpoint's `max(session_ids, default=0) + 1`.
    pub async fn allocate_websocket_session_id(&self) -> u32 {
        let table = self.sessions.lock().await;
        table.keys().copied().max().unwrap_or(0) + 1
    }

    /// Start `session_id` if it does not already exist.
    pub async fn ensure_session(&self, session_id: u32) -> Result<(), ServiceError> {
        self.get_or_create(session_id).await?;
        Ok(())
    }

    /// Create `session_id` if it does not already exist, reporting whether
    /// a new session was created. Used by the `/bash` dispatcher when a
    /// request carries no `command`: a fresh session is still allocated,
    /// but reusing an existing one is an error (there's nothing to run).
    pub async fn ensure_session_created(&self, session_id: u32) -> Result<bool, ServiceError> {
        let (_, created) = self.get_or_create(session_id).await?;
        Ok(created)
    }

    /// Stop and remove `session_id`, used to clean up a WebSocket-owned
    /// session on disconnect.
    pub async fn close_session(&self, session_id: u32) {
        let handle = {
            let mut table = self.sessions.lock().await;
            table.remove(&session_id)
        };
        if let Some(handle) = handle {
            handle.lock().await.stop();
        }
    }
}

/// Substring-match trigger for auto-recovery: checks known corruption
/// phrases in `result.system`/`result.error` rather than a dedicated
/// `needs_restart` flag on [`ToolResult`]. The fields checked here must
/// match the fields `ShellSession::run` actually writes those phrases
/// into — `"Stream reading error"` and `"must be restarted"` are both
/// `system` text, never `error` text.
fn needs_restart(result: &ToolResult) -> bool {
    let system_has = |needle: &str| result.system.as_deref().is_some_and(|s| s.contains(needle));
    let error_has = |needle: &str| result.error.as_deref().is_some_and(|s| s.contains(needle));

    system_has("must be restarted")
        || error_has("0 bytes read on a total of undefined expected bytes")
        || system_has("Stream reading error")
        || system_has("stream reading issue")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(ServiceConfig::for_workspace(PathBuf::from(
            std::env::temp_dir(),
        ))))
    }

    #[tokio::test]
    async fn execute_creates_session_on_first_use() {
        let m = manager();
        let result = m.execute(None, "echo hi", Some(5.0)).await.unwrap();
        assert_eq!(result.system.as_deref(), Some("Created new session with ID: 1"));
        assert_eq!(result.output.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn execute_reuses_explicit_session_across_calls() {
        let m = manager();
        m.execute(Some(2), "export X=42", Some(5.0)).await.unwrap();
        let result = m.execute(Some(2), "echo $X", Some(5.0)).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn execute_rejects_oversized_command() {
        let m = manager();
        let huge = "x".repeat(crate::config::MAX_COMMAND_BYTES + 1);
        let err = m.execute(Some(1), &huge, Some(1.0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::CommandTooLong { .. }));
    }

    #[tokio::test]
    async fn list_sessions_reports_idle_after_completion() {
        let m = manager();
        m.execute(Some(1), "echo hi", Some(5.0)).await.unwrap();
        let result = m.list_sessions().await;
        let out = result.output.unwrap();
        assert!(out.contains("Session 1: idle"));
    }

    #[tokio::test]
    async fn restart_replaces_session_state() {
        let m = manager();
        m.execute(Some(1), "export Y=old", Some(5.0)).await.unwrap();
        m.restart(1).await;
        let result = m.execute(Some(1), "echo ${Y:-gone}", Some(5.0)).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn distinct_sessions_run_concurrently_without_blocking_each_other() {
        let m = manager();
        let a = m.execute(Some(1), "sleep 0.2 && echo a-done", Some(5.0));
        let b = m.execute(Some(2), "echo b-done", Some(5.0));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(b.unwrap().output.as_deref(), Some("b-done"));
        assert_eq!(a.unwrap().output.as_deref(), Some("a-done"));
    }

    #[test]
    fn needs_restart_matches_known_corruption_substrings() {
        let r = ToolResult::system("Session 1 must be restarted");
        assert!(needs_restart(&r));
        let r = ToolResult::system("Stream reading error: oops");
        assert!(needs_restart(&r));
        let r = ToolResult::system("Command completed despite stream reading issue. Session ID: 1");
        assert!(needs_restart(&r));
        let r = ToolResult::output("all good");
        assert!(!needs_restart(&r));
    }

    #[tokio::test]
    async fn execute_auto_restarts_when_shell_exits_mid_command() {
        let m = manager();
        // `exit` kills the shell before the wrapped `cd`/`echo sentinel`
        // ever runs, so the stdout pipe closes without the sentinel —
        // the corrupted-stream path `needs_restart` is meant to catch.
        let result = m.execute(Some(9), "exit", Some(5.0)).await.unwrap();
        assert!(result
            .system
            .as_deref()
            .unwrap()
            .contains("was automatically restarted and the command was re-run"));

        // The session is usable again afterwards — busy was cleared, not
        // left stuck forever.
        let next = m.execute(Some(9), "echo recovered", Some(5.0)).await.unwrap();
        assert_eq!(next.output.as_deref(), Some("recovered"));
    }
}
