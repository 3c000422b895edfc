//! Workspace enumeration: `rg --files` fast path (respects nested
//! `.gitignore` files), falling back to a `walkdir` traversal if ripgrep is
//! unavailable or fails.

use crate::path_guard;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceItem {
    pub name: String,
    pub path: String,
    pub relative_path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceListing {
    pub workspace_path: String,
    pub total_items: usize,
    pub items: Vec<WorkspaceItem>,
}

/// Enumerate every non-excluded path under `root`. `git_ignore` controls
/// whether ripgrep's own `.gitignore` handling is honored (`true`) or
/// suppressed with `--no-ignore` (`false`); callers default to listing
/// everything unless they opt into git-aware filtering.
pub async fn list_workspace(
    root: &Path,
    git_ignore: bool,
    exclusion_patterns: &[String],
) -> anyhow::Result<WorkspaceListing> {
    let all_paths = ripgrep_files(root, git_ignore)
        .await
        .unwrap_or_else(|_| walkdir_files(root));

    let mut items: Vec<WorkspaceItem> = Vec::new();
    for path in all_paths {
        if path_guard::is_excluded(root, &path, exclusion_patterns) {
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };

        let is_dir = path.is_dir();
        items.push(WorkspaceItem {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_string_lossy().to_string(),
            relative_path: relative.to_string_lossy().to_string(),
            kind: if is_dir { "directory" } else { "file" },
        });
    }

    items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(WorkspaceListing {
        workspace_path: root.to_string_lossy().to_string(),
        total_items: items.len(),
        items,
    })
}

async fn ripgrep_files(root: &Path, git_ignore: bool) -> anyhow::Result<Vec<PathBuf>> {
    let mut cmd = Command::new("rg");
    cmd.args(["--files", "--hidden", "--color", "never"]);
    if !git_ignore {
        cmd.arg("--no-ignore");
    }
    cmd.current_dir(root);

    let output = cmd.output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "ripgrep failed with code {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| root.join(l.trim()))
        .collect())
}

fn walkdir_files(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .map(|entry| entry.path().to_path_buf())
        .filter(|p| p != root)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_nested_files_excluding_dotfiles() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("src")).await.unwrap();
        tokio::fs::write(dir.path().join("src/main.rs"), "").await.unwrap();
        tokio::fs::write(dir.path().join(".env"), "").await.unwrap();

        let patterns = crate::config::default_exclusion_patterns();
        let listing = list_workspace(dir.path(), false, &patterns).await.unwrap();

        let paths: Vec<_> = listing.items.iter().map(|i| i.relative_path.as_str()).collect();
        assert!(paths.contains(&"src/main.rs"));
        assert!(!paths.contains(&".env"));
    }

    #[tokio::test]
    async fn items_sorted_by_relative_path() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "").await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "").await.unwrap();

        let patterns = crate::config::default_exclusion_patterns();
        let listing = list_workspace(dir.path(), false, &patterns).await.unwrap();
        let paths: Vec<_> = listing.items.iter().map(|i| i.relative_path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }
}
