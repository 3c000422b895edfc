//! A single persistent bash session: a long-lived `/bin/bash` subprocess
//! driven over pipes, with completion detected by echoing a fixed sentinel
//! after each wrapped command.
//!
//! The sentinel protocol (wrap the command, `cd` back to the workspace
//! root, echo the sentinel, read stdout until the sentinel appears) keeps
//! the leading/trailing blank lines in the wrapped command — they are what
//! makes heredocs and multi-line constructs in `command` safe to splice in
//! verbatim.

use crate::config::{STREAM_CHUNK_BYTES, SUBPROCESS_STREAM_FLOOR_BYTES};
use crate::error::ServiceError;
use crate::result::ToolResult;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

const SENTINEL: &str = "<<exit>>";
const DEFAULT_SHELL: &str = "/bin/bash";

/// One chunk of output produced while a command streams.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

/// A long-lived bash subprocess plus the bookkeeping needed to multiplex
/// synchronous and streaming command execution over it.
pub struct ShellSession {
    session_id: u32,
    workspace_root: PathBuf,
    stderr_filters: Vec<String>,
    child: Option<Child>,
    busy: bool,
    last_command: String,
    partial_output: String,
    partial_error: String,
    /// Set while a `stream` call's reader tasks are draining stdout/stderr;
    /// reclaimed (and the pipes restored to `child`) by [`Self::finish_stream`].
    pending_stream: Option<PendingStream>,
}

struct PendingStream {
    stdout: tokio::task::JoinHandle<tokio::process::ChildStdout>,
    stderr: tokio::task::JoinHandle<tokio::process::ChildStderr>,
}

impl ShellSession {
    #[must_use]
    pub fn new(session_id: u32, workspace_root: PathBuf, stderr_filters: Vec<String>) -> Self {
        Self {
            session_id,
            workspace_root,
            stderr_filters,
            child: None,
            busy: false,
            last_command: String::new(),
            partial_output: String::new(),
            partial_error: String::new(),
            pending_stream: None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    #[must_use]
    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the underlying shell in its own process group, so the whole
    /// tree can be killed together on `stop`/restart.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut command = Command::new(DEFAULT_SHELL);
        command
            .current_dir(&self.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Start a new process group so the whole tree can be killed together.
        // SAFETY: pre_exec runs before exec in the child process.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| ServiceError::IoError(format!("failed to start bash session: {e}")))?;

        self.child = Some(child);
        Ok(())
    }

    /// Terminate the shell's process group. Idempotent.
    pub fn stop(&mut self) {
        if let Some(child) = &self.child {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(-(pid as i32)),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        self.child = None;
        self.busy = false;
    }

    fn wrapped_command(&self, command: &str) -> String {
        format!(
            "\n{command}\n\ncd \"{}\"\necho '{SENTINEL}'\n",
            self.workspace_root.display()
        )
    }

    fn filter_stderr(&self, error: &str) -> String {
        if error.is_empty() {
            return String::new();
        }
        let error = error.strip_suffix('\n').unwrap_or(error);
        error
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                !self.stderr_filters.iter().any(|pat| lower.contains(pat.as_str()))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run `command` to completion (or until `timeout_secs` elapses), return
    /// the combined result. Leaves the session `busy` on timeout so the
    /// caller can poll it later via [`Self::poll`].
    pub async fn run(
        &mut self,
        command: &str,
        timeout_secs: f64,
    ) -> Result<ToolResult, ServiceError> {
        if self.child.is_none() {
            return Err(ServiceError::NotStarted(self.session_id));
        }
        if self.busy {
            return Err(ServiceError::Busy(self.session_id, self.last_command.clone()));
        }

        // §4.B-2: if the subprocess has already exited, the session is
        // unusable until restart; surface the exit code and let the
        // manager's auto-recovery substring match pick this up.
        let exited = self
            .child
            .as_mut()
            .expect("checked above")
            .try_wait()
            .ok()
            .flatten();
        if let Some(status) = exited {
            let needs_restart = ServiceError::ProcessExited(self.session_id);
            return Ok(ToolResult {
                output: None,
                error: Some(format!(
                    "Bash has exited with returncode {}",
                    status.code().map_or_else(|| "None".to_string(), |c| c.to_string())
                )),
                system: Some(needs_restart.to_string()),
                binary_image: None,
            });
        }

        self.partial_output.clear();
        self.partial_error.clear();
        self.last_command = command.to_string();
        self.busy = true;

        let wrapped = self.wrapped_command(command);

        let child = self.child.as_mut().expect("checked above");
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| ServiceError::StreamError("stdin not piped".into()))?;

        if let Err(e) = stdin.write_all(wrapped.as_bytes()).await {
            self.busy = false;
            return Ok(ToolResult::error(format!("Failed to send command to bash: {e}"))
                .with_system_prefix("Session may need to be restarted"));
        }
        if stdin.flush().await.is_err() {
            self.busy = false;
            return Ok(ToolResult::error("Failed to send command to bash: broken pipe")
                .with_system_prefix("Session may need to be restarted"));
        }

        let stdout = child
            .stdout
            .as_mut()
            .ok_or_else(|| ServiceError::StreamError("stdout not piped".into()))?;
        let stderr = child
            .stderr
            .as_mut()
            .ok_or_else(|| ServiceError::StreamError("stderr not piped".into()))?;

        // Distinguishes a clean sentinel match from a stream that closed
        // (EOF or an over-long buffer) before the sentinel was observed, so
        // the two can be reported differently: the former is a success, the
        // latter always clears `busy` (the session is done either way, the
        // caller just didn't get a clean read) per `bash_server.py`'s
        // `IncompleteReadError`/`ConnectionResetError` handling.
        enum ReadOutcome {
            Sentinel(Vec<u8>),
            Eof(Vec<u8>),
        }

        let read_until_sentinel = async {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                if buf.len() > SUBPROCESS_STREAM_FLOOR_BYTES {
                    return Ok::<ReadOutcome, std::io::Error>(ReadOutcome::Eof(buf));
                }
                let n = stdout.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(ReadOutcome::Eof(buf));
                }
                buf.extend_from_slice(&chunk[..n]);
                if contains_sentinel(&buf) {
                    return Ok(ReadOutcome::Sentinel(buf));
                }
            }
        };

        match timeout(Duration::from_secs_f64(timeout_secs), read_until_sentinel).await {
            Ok(Ok(ReadOutcome::Sentinel(buf))) => {
                let output_raw = String::from_utf8_lossy(&buf).replace(SENTINEL, "");

                let mut err_buf = vec![0u8; 65536];
                let err_n = tokio::time::timeout(
                    Duration::from_millis(20),
                    stderr.read(&mut err_buf),
                )
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or(0);
                let error_raw = String::from_utf8_lossy(&err_buf[..err_n]).to_string();

                self.busy = false;

                Ok(ToolResult {
                    output: Some(output_raw.trim_end_matches('\n').to_string()),
                    error: Some(self.filter_stderr(&error_raw)),
                    system: None,
                    binary_image: None,
                })
            }
            Ok(Ok(ReadOutcome::Eof(buf))) => {
                let output_raw = String::from_utf8_lossy(&buf).replace(SENTINEL, "");

                let mut err_buf = vec![0u8; 65536];
                let err_n = tokio::time::timeout(
                    Duration::from_millis(20),
                    stderr.read(&mut err_buf),
                )
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or(0);
                let error_raw = String::from_utf8_lossy(&err_buf[..err_n]).to_string();

                // The stream closed before we chose to stop reading, but the
                // sentinel may still be present in what we already have (a
                // stream reset racing the final bytes); treat that as a
                // successful completion with a warning rather than a failure.
                self.busy = false;

                if contains_sentinel(&buf) {
                    Ok(ToolResult {
                        output: Some(output_raw.trim_end_matches('\n').to_string()),
                        error: Some(self.filter_stderr(&error_raw)),
                        system: Some(format!(
                            "Command completed despite stream reading issue. Session ID: {}",
                            self.session_id
                        )),
                        binary_image: None,
                    })
                } else {
                    self.partial_output = output_raw;
                    self.partial_error = error_raw.clone();
                    Ok(ToolResult {
                        output: Some(self.partial_output.clone()),
                        error: Some(self.filter_stderr(&error_raw)),
                        system: Some(
                            "Stream reading error: connection closed. Command may have failed or produced output exceeding buffer limits."
                                .to_string(),
                        ),
                        binary_image: None,
                    })
                }
            }
            Ok(Err(e)) => {
                self.busy = false;
                Ok(ToolResult::error(format!("Unexpected error executing command: {e}"))
                    .with_system_prefix("Session may need to be restarted"))
            }
            Err(_) => {
                // Still running: session stays busy, caller can poll it.
                Ok(ToolResult {
                    output: Some(self.partial_output.clone()),
                    error: Some(self.filter_stderr(&self.partial_error.clone())),
                    system: Some(format!(
                        "Process timed out after {timeout_secs} seconds. This process will continue to run in session {}.",
                        self.session_id
                    )),
                    binary_image: None,
                })
            }
        }
    }

    /// Poll the output accumulated so far by a still-running command,
    /// without blocking for more. Used by the `check_session` request.
    pub async fn poll(&mut self) -> ToolResult {
        if self.child.is_none() {
            return ToolResult::error("Session not started")
                .with_system_prefix(&format!("Session ID: {} not started", self.session_id));
        }

        if !self.busy {
            return ToolResult::system(format!("Session ID: {}", self.session_id));
        }

        let Some(child) = self.child.as_mut() else {
            self.busy = false;
            return ToolResult::error("Process terminated unexpectedly").with_system_prefix(
                &format!("Session ID: {} process terminated", self.session_id),
            );
        };

        let mut extra = [0u8; 8192];
        if let Some(stdout) = child.stdout.as_mut() {
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(20), stdout.read(&mut extra)).await
            {
                if n > 0 {
                    self.partial_output
                        .push_str(&String::from_utf8_lossy(&extra[..n]));
                }
            }
        }

        let mut err_extra = [0u8; 8192];
        if let Some(stderr) = child.stderr.as_mut() {
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(20), stderr.read(&mut err_extra)).await
            {
                if n > 0 {
                    self.partial_error
                        .push_str(&String::from_utf8_lossy(&err_extra[..n]));
                }
            }
        }

        let filtered_error = self.filter_stderr(&self.partial_error);

        if self.partial_output.contains(SENTINEL) {
            self.busy = false;
            let output = self.partial_output.replace(SENTINEL, "");
            ToolResult {
                output: Some(output.trim_end_matches('\n').to_string()),
                error: Some(filtered_error),
                system: Some(format!("Command completed. Session ID: {}", self.session_id)),
                binary_image: None,
            }
        } else {
            ToolResult {
                output: Some(self.partial_output.clone()),
                error: Some(filtered_error),
                system: Some(format!(
                    "Command still running. Session ID: {}",
                    self.session_id
                )),
                binary_image: None,
            }
        }
    }

    /// Run `command`, yielding output chunks as they arrive until the
    /// sentinel is seen on stdout. Stderr lines are filtered and interleaved
    /// as they arrive, matching `stream_command`'s dual-reader fan-in.
    pub async fn stream(
        &mut self,
        command: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, ServiceError> {
        if self.child.is_none() {
            self.start().await?;
        }
        if self.busy {
            return Err(ServiceError::Busy(self.session_id, self.last_command.clone()));
        }

        self.partial_output.clear();
        self.partial_error.clear();
        self.last_command = command.to_string();
        self.busy = true;

        let wrapped = self.wrapped_command(command);
        let stderr_filters = self.stderr_filters.clone();

        let child = self.child.as_mut().expect("checked above");
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::StreamError("stdin not piped".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::StreamError("stdout not piped".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServiceError::StreamError("stderr not piped".into()))?;

        stdin
            .write_all(wrapped.as_bytes())
            .await
            .map_err(|e| ServiceError::StreamError(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ServiceError::StreamError(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);

        let stdout_tx = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];
            loop {
                let n = match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));

                if let Some(pos) = buffer.find(SENTINEL) {
                    let before = buffer[..pos].to_string();
                    if !before.is_empty() {
                        let _ = stdout_tx.send(StreamChunk::Stdout(before)).await;
                    }
                    break;
                }

                if !buffer.is_empty() {
                    let _ = stdout_tx.send(StreamChunk::Stdout(std::mem::take(&mut buffer))).await;
                }
            }
            stdout
        });

        let stderr_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];
            loop {
                let n = match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let text = String::from_utf8_lossy(&chunk[..n]).to_string();
                let filtered = filter_stderr_text(&text, &stderr_filters);
                if !filtered.is_empty() {
                    let _ = stderr_tx.send(StreamChunk::Stderr(filtered)).await;
                }
            }
            stderr
        });
        drop(tx);

        // stdin is done being written to for this command; hand it back so
        // the session remains usable once the stream finishes.
        self.child.as_mut().expect("checked above").stdin = Some(stdin);
        self.pending_stream = Some(PendingStream {
            stdout: stdout_task,
            stderr: stderr_task,
        });

        Ok(rx)
    }

    /// Reclaim stdout/stderr from a finished `stream` call and clear the
    /// busy flag. Callers must invoke this once the receiver returned by
    /// [`Self::stream`] is drained (closed), before issuing the session's
    /// next command.
    pub async fn finish_stream(&mut self) {
        let Some(pending) = self.pending_stream.take() else {
            self.busy = false;
            return;
        };

        if let Some(child) = self.child.as_mut() {
            if let Ok(stdout) = pending.stdout.await {
                child.stdout = Some(stdout);
            }
            if let Ok(stderr) = pending.stderr.await {
                child.stderr = Some(stderr);
            }
        }

        self.busy = false;
    }
}

fn contains_sentinel(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf);
    text.contains(SENTINEL)
}

fn filter_stderr_text(text: &str, filters: &[String]) -> String {
    if text.is_empty() {
        return String::new();
    }
    let lower = text.to_lowercase();
    if filters.iter().any(|pat| lower.contains(pat.as_str())) {
        String::new()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_stderr_filters;

    fn session(id: u32) -> ShellSession {
        ShellSession::new(id, std::env::temp_dir(), default_stderr_filters())
    }

    #[tokio::test]
    async fn run_before_start_errors() {
        let mut s = session(1);
        let err = s.run("echo hi", 5.0).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotStarted(1)));
    }

    #[tokio::test]
    async fn run_echo_returns_output() {
        let mut s = session(2);
        s.start().await.unwrap();
        let result = s.run("echo hello", 5.0).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("hello"));
        s.stop();
    }

    #[tokio::test]
    async fn state_persists_across_commands() {
        let mut s = session(3);
        s.start().await.unwrap();
        s.run("export FOO=bar", 5.0).await.unwrap();
        let result = s.run("echo $FOO", 5.0).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("bar"));
        s.stop();
    }

    #[tokio::test]
    async fn busy_session_rejects_concurrent_run() {
        let mut s = session(4);
        s.start().await.unwrap();
        s.busy = true;
        s.last_command = "sleep 100".to_string();
        let err = s.run("echo hi", 1.0).await.unwrap_err();
        assert!(matches!(err, ServiceError::Busy(4, _)));
        s.stop();
    }

    #[tokio::test]
    async fn stderr_filters_suppress_known_noise() {
        let s = session(5);
        let filtered = s.filter_stderr("Failed to connect to the bus: foo\nreal error\n");
        assert_eq!(filtered, "real error");
    }

    #[tokio::test]
    async fn run_detects_already_exited_process() {
        let mut s = session(6);
        s.start().await.unwrap();

        if let Some(child) = s.child.as_ref() {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        // Give the reaper a moment so `try_wait` observes the exit.
        for _ in 0..20 {
            if s.child.as_mut().unwrap().try_wait().ok().flatten().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let result = s.run("echo hi", 5.0).await.unwrap();
        assert!(result.system.as_deref().unwrap().contains("must be restarted"));
        assert!(result.error.as_deref().unwrap().contains("Bash has exited with returncode"));
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn run_clears_busy_when_shell_exits_mid_command() {
        let mut s = session(7);
        s.start().await.unwrap();
        // `exit` kills bash before the wrapped `cd`/`echo sentinel` can run,
        // closing stdout without the sentinel ever appearing.
        let result = s.run("exit", 5.0).await.unwrap();
        assert!(!s.is_busy());
        assert!(result.system.as_deref().unwrap().contains("Stream reading error"));
    }
}
