//! Process-wide configuration, read once at startup.
//!
//! Every knob here has a sensible default and can be overridden by an env
//! var, with no hot-reload.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default bind address.
const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Default per-command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Command length cap in bytes, rejected before a session ever sees it.
pub const MAX_COMMAND_BYTES: usize = 100_000;

/// Streaming read chunk size in bytes.
pub const STREAM_CHUNK_BYTES: usize = 256;

/// Ceiling on how much output a non-streaming `run` will accumulate before
/// giving up and returning what it has.
pub const SUBPROCESS_STREAM_FLOOR_BYTES: usize = 3 * 1024 * 1024;

/// Root-level names excluded from listing/serving regardless of dot-prefix.
pub fn default_exclusion_patterns() -> Vec<String> {
    [
        "bash_server.py",
        "lsp.py",
        ".codesandbox",
        ".devcontainer",
        "__pycache__",
        "README",
        "README.md",
        "README.txt",
        "README.rst",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Stderr substrings filtered out of every command result, case-insensitive.
pub fn default_stderr_filters() -> Vec<String> {
    [
        "failed to connect to the bus",
        "failed to call method",
        "viz_main_impl",
        "object_proxy",
        "dbus",
        "setting up watches",
        "watches established",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Process-wide service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub workspace_root: PathBuf,
    pub bind_addr: SocketAddr,
    pub default_timeout: Duration,
    pub stderr_filters: Vec<String>,
    pub exclusion_patterns: Vec<String>,
}

impl ServiceConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults. The workspace root falls back to the current working
    /// directory if `WORKSPACE_EXEC_ROOT` is unset or does not exist.
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace_root = std::env::var("WORKSPACE_EXEC_ROOT")
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .unwrap_or(std::env::current_dir()?);

        let bind_addr = std::env::var("WORKSPACE_EXEC_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_BIND.parse().expect("valid default bind address"));

        let default_timeout = std::env::var("WORKSPACE_EXEC_DEFAULT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        let mut stderr_filters = default_stderr_filters();
        if let Ok(extra) = std::env::var("WORKSPACE_EXEC_STDERR_FILTERS") {
            stderr_filters.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }

        Ok(Self {
            workspace_root,
            bind_addr,
            default_timeout,
            stderr_filters,
            exclusion_patterns: default_exclusion_patterns(),
        })
    }

    #[must_use]
    pub fn for_workspace(root: PathBuf) -> Self {
        Self {
            workspace_root: root,
            bind_addr: DEFAULT_BIND.parse().expect("valid default bind address"),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            stderr_filters: default_stderr_filters(),
            exclusion_patterns: default_exclusion_patterns(),
        }
    }
}
