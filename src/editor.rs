//! Structured file editor: read/write/create/delete/list/mkdir/rmdir/move/
//! copy/view/replace/insert/delete_lines/undo/grep, plus `exists`.
//!
//! Every mutating text operation (`replace`, `insert`, `delete_lines`)
//! pushes the file's prior content onto a 2-entry undo stack keyed by
//! resolved path before writing, so `undo` restores the most recent
//! snapshot.

use crate::error::ServiceError;
use crate::path_guard;
use crate::result::ToolResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

const UNDO_DEPTH: usize = 2;

fn shorten(text: &str, limit: usize) -> String {
    let escaped = text.replace('\n', "\\n");
    if escaped.chars().count() <= limit {
        escaped
    } else {
        let truncated: String = escaped.chars().take(limit).collect();
        format!("{truncated}...")
    }
}

/// Owns the workspace root and the per-path undo history.
pub struct FileEditor {
    workspace_root: PathBuf,
    history: Mutex<HashMap<PathBuf, Vec<String>>>,
}

impl FileEditor {
    #[must_use]
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ServiceError> {
        path_guard::resolve(&self.workspace_root, path)
    }

    fn push_history(&self, path: &Path, previous_content: String) {
        let mut history = self.history.lock().expect("undo history lock poisoned");
        let entries = history.entry(path.to_path_buf()).or_default();
        entries.push(previous_content);
        if entries.len() > UNDO_DEPTH {
            entries.remove(0);
        }
    }

    pub async fn read(&self, path: &str, binary: bool, line_numbers: bool) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_file() {
            return Err(ServiceError::NotFile(full_path));
        }

        if binary {
            let bytes = tokio::fs::read(&full_path).await?;
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
            return Ok(ToolResult {
                output: Some(encoded),
                error: None,
                system: Some("binary".to_string()),
                binary_image: None,
            });
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        if line_numbers {
            Ok(ToolResult::output(number_lines(&content, 1)))
        } else {
            Ok(ToolResult::output(content))
        }
    }

    pub async fn write(&self, path: &str, content: &str, binary: bool) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_bytes(&full_path, content, binary, false).await?;
        Ok(ToolResult::output(format!("File written to {path}")))
    }

    pub async fn append(&self, path: &str, content: &str, binary: bool) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_bytes(&full_path, content, binary, true).await?;
        Ok(ToolResult::output(format!("Appended to file {path}")))
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if full_path.is_file() {
            tokio::fs::remove_file(&full_path).await?;
        } else if full_path.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&full_path).await?;
            } else {
                tokio::fs::remove_dir(&full_path).await?;
            }
        } else {
            return Err(ServiceError::NotFound(format!("path does not exist: {path}")));
        }
        self.history.lock().expect("undo history lock poisoned").remove(&full_path);
        Ok(ToolResult::output(format!("Deleted {path}")))
    }

    pub async fn exists(&self, path: &str) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        Ok(ToolResult::output(full_path.exists().to_string()))
    }

    pub async fn list_dir(&self, path: &str) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_dir() {
            return Err(ServiceError::NotDirectory(full_path));
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&full_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await?.is_dir() {
                names.push(format!("{name}/"));
            } else {
                names.push(name);
            }
        }
        names.sort();
        Ok(ToolResult::output(names.join("\n")))
    }

    pub async fn mkdir(&self, path: &str) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        tokio::fs::create_dir_all(&full_path).await?;
        Ok(ToolResult::output(format!("Directory created: {path}")))
    }

    pub async fn rmdir(&self, path: &str) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        tokio::fs::remove_dir(&full_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::DirectoryNotEmpty => ServiceError::NotEmpty(full_path.clone()),
                _ => ServiceError::IoError(e.to_string()),
            })?;
        Ok(ToolResult::output(format!("Directory removed: {path}")))
    }

    pub async fn mv(&self, src: &str, dst: &str) -> Result<ToolResult, ServiceError> {
        let src_path = self.resolve(src)?;
        let dst_path = self.resolve(dst)?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src_path, &dst_path).await?;

        let mut history = self.history.lock().expect("undo history lock poisoned");
        if let Some(entries) = history.remove(&src_path) {
            history.insert(dst_path, entries);
        }
        Ok(ToolResult::output(format!("Moved {src} to {dst}")))
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<ToolResult, ServiceError> {
        let src_path = self.resolve(src)?;
        let dst_path = self.resolve(dst)?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if src_path.is_file() {
            tokio::fs::copy(&src_path, &dst_path).await?;
        } else if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path).await?;
        } else {
            return Err(ServiceError::NotFound(format!("source path does not exist: {src}")));
        }
        Ok(ToolResult::output(format!("Copied {src} to {dst}")))
    }

    pub async fn view(
        &self,
        path: &str,
        view_range: Option<(i64, i64)>,
        line_numbers: bool,
    ) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;

        if full_path.is_dir() {
            if view_range.is_some() {
                return Err(ServiceError::InvalidArguments(
                    "view_range not applicable for directories".into(),
                ));
            }
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&full_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().await?.is_dir() {
                    names.push(format!("  {name}/"));
                } else {
                    names.push(format!("  {name}"));
                }
            }
            names.sort();
            return Ok(ToolResult::output(format!(
                "Directory contents of {path}:\n{}",
                names.join("\n")
            )));
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let lines: Vec<&str> = content.lines().collect();

        let (content, start_num) = if let Some((start, end)) = view_range {
            let len = lines.len() as i64;
            let start = if start < 0 { len + start + 1 } else { start };
            let end = if end < 0 { len + end + 1 } else { end };
            if start < 1 || start > len || end < start || end > len {
                return Err(ServiceError::OutOfRange(format!(
                    "Invalid view_range: [{start}, {end}]. File has {len} lines"
                )));
            }
            let slice = lines[(start as usize - 1)..(end as usize)].join("\n");
            (slice, start)
        } else {
            (content, 1)
        };

        if line_numbers {
            Ok(ToolResult::output(number_lines(&content, start_num)))
        } else {
            Ok(ToolResult::output(content))
        }
    }

    pub async fn create(&self, path: &str, content: &str, binary: bool) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if full_path.exists() {
            return Err(ServiceError::AlreadyExists(full_path));
        }
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_bytes(&full_path, content, binary, false).await?;
        Ok(ToolResult::output(format!("File created: {path}")))
    }

    pub async fn replace(
        &self,
        path: &str,
        old_str: &str,
        new_str: &str,
        all_occurrences: bool,
    ) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_file() {
            return Err(ServiceError::NotFile(full_path));
        }

        let content = tokio::fs::read_to_string(&full_path).await?;

        if old_str == new_str && content.matches(old_str).count() == 1 {
            return Ok(ToolResult::output(format!(
                "Replaced \"{}\" with \"{}\"",
                shorten(old_str, 120),
                shorten(new_str, 120)
            )));
        }

        let new_content = if content.contains(old_str) {
            let count = content.matches(old_str).count();
            if count > 1 && !all_occurrences {
                return Err(ServiceError::Ambiguous);
            }
            if all_occurrences {
                content.replace(old_str, new_str)
            } else {
                content.replacen(old_str, new_str, 1)
            }
        } else {
            let cmp_content = content.replace("\r\n", "\n");
            let cmp_old = old_str.replace("\r\n", "\n");
            if !cmp_content.contains(&cmp_old) {
                return Err(ServiceError::NotFound(format!("'{old_str}' not found")));
            }

            let norm_new = new_str.replace("\r\n", "\n");
            let count = cmp_content.matches(cmp_old.as_str()).count();
            if count > 1 && !all_occurrences {
                return Err(ServiceError::Ambiguous);
            }
            let norm_new_content = if all_occurrences {
                cmp_content.replace(cmp_old.as_str(), &norm_new)
            } else {
                cmp_content.replacen(cmp_old.as_str(), &norm_new, 1)
            };

            if content.contains("\r\n") {
                norm_new_content.replace('\n', "\r\n")
            } else {
                norm_new_content
            }
        };

        self.push_history(&full_path, content);
        tokio::fs::write(&full_path, &new_content).await?;

        Ok(ToolResult::output(format!(
            "Replaced \"{}\" with \"{}\"",
            shorten(old_str, 120),
            shorten(new_str, 120)
        )))
    }

    pub async fn insert(&self, path: &str, line: i64, text: &str) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_file() {
            return Err(ServiceError::NotFile(full_path));
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let mut lines: Vec<&str> = content.lines().collect();

        if line < 1 || line > lines.len() as i64 + 1 {
            return Err(ServiceError::OutOfRange(format!("Line number {line} is out of range")));
        }

        lines.insert(line as usize - 1, text);
        let new_content = lines.join("\n");

        self.push_history(&full_path, content);
        tokio::fs::write(&full_path, &new_content).await?;

        Ok(ToolResult::output(format!("Inserted \"{}\" at line {line}", shorten(text, 120))))
    }

    pub async fn delete_lines(&self, path: &str, lines_to_delete: &[i64]) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_file() {
            return Err(ServiceError::NotFile(full_path));
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let file_lines: Vec<&str> = content.lines().collect();
        let to_delete: std::collections::HashSet<i64> = lines_to_delete.iter().copied().collect();

        let new_lines: Vec<&str> = file_lines
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !to_delete.contains(&(*i as i64 + 1)))
            .map(|(_, line)| line)
            .collect();
        let new_content = new_lines.join("\n");

        self.push_history(&full_path, content);
        tokio::fs::write(&full_path, &new_content).await?;

        Ok(ToolResult::output(format!("Deleted lines {lines_to_delete:?}")))
    }

    pub async fn undo(&self, path: &str) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        if !full_path.is_file() {
            return Err(ServiceError::NotFound(format!("file does not exist: {path}")));
        }

        let previous = {
            let mut history = self.history.lock().expect("undo history lock poisoned");
            match history.get_mut(&full_path) {
                Some(entries) if !entries.is_empty() => entries.pop(),
                _ => None,
            }
        };

        let Some(previous_content) = previous else {
            return Err(ServiceError::NoHistory(full_path));
        };

        tokio::fs::write(&full_path, previous_content).await?;
        Ok(ToolResult::output(format!("Undid last edit on {path}")))
    }

    pub async fn grep(
        &self,
        pattern: &str,
        path: &str,
        case_sensitive: bool,
        recursive: bool,
        line_numbers: bool,
    ) -> Result<ToolResult, ServiceError> {
        let full_path = self.resolve(path)?;
        let regex = build_regex(pattern, case_sensitive)?;

        let mut matches = Vec::new();

        if full_path.is_file() {
            grep_file(&full_path, &self.workspace_root, &regex, line_numbers, &mut matches).await;
        } else if full_path.is_dir() {
            if !recursive {
                return Err(ServiceError::InvalidArguments(
                    "Recursive search must be enabled for directories".into(),
                ));
            }
            let mut stack = vec![full_path.clone()];
            while let Some(dir) = stack.pop() {
                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let entry_path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        stack.push(entry_path);
                    } else {
                        grep_file(&entry_path, &self.workspace_root, &regex, line_numbers, &mut matches).await;
                    }
                }
            }
        } else {
            return Err(ServiceError::NotFound(format!("path does not exist: {path}")));
        }

        if matches.is_empty() {
            return Ok(ToolResult::output("No matches found"));
        }

        Ok(ToolResult::output(matches.join("\n")))
    }
}

fn number_lines(content: &str, start: i64) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>6}\t{line}", start + i as i64))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn write_bytes(full_path: &Path, content: &str, binary: bool, append: bool) -> Result<(), ServiceError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    let mut file = options.open(full_path).await?;

    if binary {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, content)
            .map_err(|e| ServiceError::InvalidArguments(format!("invalid base64 content: {e}")))?;
        file.write_all(&bytes).await?;
    } else {
        file.write_all(content.as_bytes()).await?;
    }
    Ok(())
}

async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), ServiceError> {
    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type().await?.is_dir() {
            Box::pin(copy_dir_recursive(&from, &to)).await?;
        } else {
            tokio::fs::copy(&from, &to).await?;
        }
    }
    Ok(())
}

fn build_regex(pattern: &str, case_sensitive: bool) -> Result<regex::Regex, ServiceError> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| ServiceError::InvalidArguments(format!("invalid pattern: {e}")))
}

async fn grep_file(
    file_path: &Path,
    workspace_root: &Path,
    regex: &regex::Regex,
    line_numbers: bool,
    matches: &mut Vec<String>,
) {
    let Ok(content) = tokio::fs::read_to_string(file_path).await else {
        return;
    };

    let relative = file_path
        .strip_prefix(workspace_root)
        .unwrap_or(file_path)
        .to_string_lossy()
        .to_string();

    for (i, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            if line_numbers {
                matches.push(format!("{relative}:{}:{}", i + 1, line.trim()));
            } else {
                matches.push(format!("{relative}:{}", line.trim()));
            }
        }
    }
}
