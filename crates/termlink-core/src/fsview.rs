//! Read-only filesystem view served to clients.
//!
//! Listing and file-read helpers behind the connection manager. No watcher:
//! clients poll with [`check_modified`], comparing both mtime and content so
//! editors that rewrite files without touching timestamps are still caught.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_directory: bool,
    pub size: u64,
    /// Milliseconds since the unix epoch.
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: PathBuf,
    pub content: String,
    pub modified: u64,
}

fn mtime_millis(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// List a directory, dotfiles skipped, directories first, each group
/// sorted lexicographically (case-insensitive).
pub fn list_directory(path: &Path) -> Result<Vec<DirEntry>> {
    let entries = fs::read_dir(path)?;
    let mut out: Vec<DirEntry> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            let meta = e.metadata().ok()?;
            Some(DirEntry {
                path: e.path(),
                is_directory: meta.is_dir(),
                size: meta.len(),
                modified: mtime_millis(&meta),
                name,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    Ok(out)
}

pub fn read_file(path: &Path) -> Result<FileContent> {
    let content = fs::read_to_string(path)?;
    let meta = fs::metadata(path)?;
    Ok(FileContent {
        path: path.to_path_buf(),
        content,
        modified: mtime_millis(&meta),
    })
}

/// Re-read a file the client already holds. Returns `Some` with the fresh
/// content when either the timestamp or the content differs from what the
/// client last saw, `None` when nothing changed.
pub fn check_modified(
    path: &Path,
    last_known_modified: u64,
    last_known_content: &str,
) -> Result<Option<FileContent>> {
    let current = read_file(path)?;
    if current.modified != last_known_modified || current.content != last_known_content {
        Ok(Some(current))
    } else {
        Ok(None)
    }
}
