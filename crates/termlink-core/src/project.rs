//! Project context.
//!
//! Projects are plain directories under a projects root. The only state
//! persisted across daemon restarts is a single last-project pointer file,
//! overwritten atomically on every project switch. Everything else is
//! recomputed from the filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

/// Valid project names: filesystem-safe, no separators.
static PROJECT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

const POINTER_FILE: &str = "last-project.json";
const DEFAULT_PROJECT: &str = "workspace";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Persisted pointer to the most recently used project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastProjectPointer {
    pub name: String,
    pub path: PathBuf,
    pub last_accessed: DateTime<Utc>,
}

/// Filesystem-backed project registry.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    projects_dir: PathBuf,
    home_dir: PathBuf,
    pointer_path: PathBuf,
}

impl ProjectStore {
    /// `state_dir` holds the pointer file; `projects_dir` holds project
    /// directories; `home_dir` is the fallback of last resort.
    pub fn new(state_dir: &Path, projects_dir: PathBuf, home_dir: PathBuf) -> Self {
        Self {
            pointer_path: state_dir.join(POINTER_FILE),
            projects_dir,
            home_dir,
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Directory a fresh session should start in.
    ///
    /// Fallback chain: persisted pointer (if its path still exists) →
    /// most-recently-modified project directory (persisting the pointer
    /// back) → home directory.
    pub fn initial_directory(&self) -> PathBuf {
        if let Some(pointer) = self.load_pointer() {
            if pointer.path.is_dir() {
                debug!(project = %pointer.name, "resuming last project");
                return pointer.path;
            }
            warn!(project = %pointer.name, path = %pointer.path.display(),
                "last project pointer is stale, falling back");
        }

        if let Some(recent) = self.list_projects().into_iter().next() {
            info!(project = %recent.name, "falling back to most recent project");
            if let Err(e) = self.save_pointer(&recent.name, &recent.path) {
                warn!(error = %e, "failed to persist fallback pointer");
            }
            return recent.path;
        }

        self.home_dir.clone()
    }

    pub fn load_pointer(&self) -> Option<LastProjectPointer> {
        let raw = fs::read_to_string(&self.pointer_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(pointer) => Some(pointer),
            Err(e) => {
                warn!(error = %e, "last project pointer is corrupt, ignoring");
                None
            }
        }
    }

    /// Overwrite the pointer file. Never appends; the file holds exactly
    /// one JSON object.
    pub fn save_pointer(&self, name: &str, path: &Path) -> Result<()> {
        let pointer = LastProjectPointer {
            name: name.to_string(),
            path: path.to_path_buf(),
            last_accessed: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&pointer)
            .map_err(|e| SessionError::transport(format!("pointer serialize: {e}")))?;
        if let Some(parent) = self.pointer_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.pointer_path, json)?;
        debug!(project = %name, "last project pointer saved");
        Ok(())
    }

    /// All project directories, most recently modified first.
    pub fn list_projects(&self) -> Vec<Project> {
        let Ok(entries) = fs::read_dir(&self.projects_dir) else {
            return Vec::new();
        };
        let mut projects: Vec<Project> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    return None;
                }
                let meta = e.metadata().ok()?;
                let modified: DateTime<Utc> = meta.modified().ok()?.into();
                let created: DateTime<Utc> =
                    meta.created().ok().map(Into::into).unwrap_or(modified);
                Some(Project {
                    name,
                    path: e.path(),
                    created,
                    modified,
                })
            })
            .collect();
        projects.sort_by(|a, b| b.modified.cmp(&a.modified));
        projects
    }

    /// Create a new project directory. The name must match `[A-Za-z0-9_-]+`.
    /// A git repository is initialized best-effort and a README is seeded.
    pub fn create_project(&self, name: &str) -> Result<Project> {
        if !PROJECT_NAME.is_match(name) {
            return Err(SessionError::transport(format!(
                "invalid project name `{name}`: use letters, digits, `-`, `_`"
            )));
        }
        let path = self.projects_dir.join(name);
        if path.exists() {
            return Err(SessionError::transport(format!(
                "project `{name}` already exists"
            )));
        }
        fs::create_dir_all(&path)?;

        let readme = path.join("README.md");
        fs::write(&readme, format!("# {name}\n"))?;

        // git init is a convenience, not a requirement.
        match std::process::Command::new("git")
            .arg("init")
            .current_dir(&path)
            .output()
        {
            Ok(out) if out.status.success() => {
                debug!(project = %name, "git repository initialized")
            }
            Ok(out) => warn!(project = %name, code = ?out.status.code(), "git init failed"),
            Err(e) => warn!(project = %name, error = %e, "git unavailable"),
        }

        info!(project = %name, path = %path.display(), "project created");
        let now = Utc::now();
        Ok(Project {
            name: name.to_string(),
            path,
            created: now,
            modified: now,
        })
    }

    /// Make sure at least one project exists; returns the default project's
    /// path. Called at daemon startup.
    pub fn ensure_default_project(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.projects_dir)?;
        if !self.list_projects().is_empty() {
            return Ok(self.projects_dir.clone());
        }
        let project = self.create_project(DEFAULT_PROJECT)?;
        self.save_pointer(&project.name, &project.path)?;
        Ok(project.path)
    }

    /// Whether a project directory carries prior assistant session state,
    /// which decides the `--continue` flag on launch. True when `.claude/`
    /// exists and is non-empty, or a legacy session file has content.
    pub fn has_assistant_session(project_path: &Path) -> bool {
        let claude_dir = project_path.join(".claude");
        if claude_dir.is_dir() {
            if let Ok(mut entries) = fs::read_dir(&claude_dir) {
                if entries.next().is_some() {
                    return true;
                }
            }
        }
        for legacy in [".claude.json", "claude-session.json"] {
            if let Ok(meta) = fs::metadata(project_path.join(legacy)) {
                if meta.len() > 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Provision a workspace for an expert session, seeded with the task
    /// description as `task.json`. Named `expert-<session_id>` when the
    /// client supplies an id, `expert-<timestamp>` otherwise.
    pub fn expert_workspace(&self, task: &str, session_id: Option<&str>) -> Result<PathBuf> {
        let suffix = match session_id {
            Some(id) => id.to_string(),
            None => Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string(),
        };
        let dir = self.projects_dir.join(format!("expert-{suffix}"));
        fs::create_dir_all(&dir)?;

        let seed = serde_json::json!({
            "task": task,
            "created": Utc::now().to_rfc3339(),
        });
        let json = serde_json::to_string_pretty(&seed)
            .map_err(|e| SessionError::transport(format!("task seed serialize: {e}")))?;
        fs::write(dir.join("task.json"), json)?;

        info!(path = %dir.display(), "expert workspace provisioned");
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &Path) -> ProjectStore {
        ProjectStore::new(
            &root.join("state"),
            root.join("projects"),
            root.join("home"),
        )
    }

    #[test]
    fn pointer_roundtrip_overwrites() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        s.save_pointer("alpha", &tmp.path().join("projects/alpha"))
            .unwrap();
        s.save_pointer("beta", &tmp.path().join("projects/beta"))
            .unwrap();

        let pointer = s.load_pointer().unwrap();
        assert_eq!(pointer.name, "beta");
        // The file holds exactly one JSON object, not an append log.
        let raw = fs::read_to_string(tmp.path().join("state/last-project.json")).unwrap();
        serde_json::from_str::<LastProjectPointer>(&raw).unwrap();
    }

    #[test]
    fn initial_directory_prefers_valid_pointer() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let project = tmp.path().join("projects/alpha");
        fs::create_dir_all(&project).unwrap();
        // A decoy project that would win the mtime fallback.
        fs::create_dir_all(tmp.path().join("projects/zeta")).unwrap();

        s.save_pointer("alpha", &project).unwrap();
        assert_eq!(s.initial_directory(), project);
    }

    #[test]
    fn initial_directory_falls_back_on_stale_pointer() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let survivor = tmp.path().join("projects/survivor");
        fs::create_dir_all(&survivor).unwrap();

        s.save_pointer("gone", &tmp.path().join("projects/gone"))
            .unwrap();
        assert_eq!(s.initial_directory(), survivor);
        // The fallback repaired the pointer.
        assert_eq!(s.load_pointer().unwrap().name, "survivor");
    }

    #[test]
    fn initial_directory_falls_back_to_home() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        assert_eq!(s.initial_directory(), tmp.path().join("home"));
    }

    #[test]
    fn corrupt_pointer_is_ignored() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        fs::create_dir_all(tmp.path().join("state")).unwrap();
        fs::write(tmp.path().join("state/last-project.json"), "{not json").unwrap();
        assert!(s.load_pointer().is_none());
        assert_eq!(s.initial_directory(), tmp.path().join("home"));
    }

    #[test]
    fn create_project_validates_name() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        assert!(s.create_project("../escape").is_err());
        assert!(s.create_project("has space").is_err());
        assert!(s.create_project("").is_err());

        let project = s.create_project("good_name-1").unwrap();
        assert!(project.path.is_dir());
        assert!(project.path.join("README.md").is_file());
        // Duplicate creation is rejected.
        assert!(s.create_project("good_name-1").is_err());
    }

    #[test]
    fn ensure_default_project_is_idempotent() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        s.ensure_default_project().unwrap();
        assert_eq!(s.list_projects().len(), 1);
        s.ensure_default_project().unwrap();
        assert_eq!(s.list_projects().len(), 1);
    }

    #[test]
    fn detects_assistant_session_state() {
        let tmp = tempdir().unwrap();
        let project = tmp.path().join("p");
        fs::create_dir_all(&project).unwrap();
        assert!(!ProjectStore::has_assistant_session(&project));

        // Empty .claude dir is not session state.
        fs::create_dir_all(project.join(".claude")).unwrap();
        assert!(!ProjectStore::has_assistant_session(&project));

        fs::write(project.join(".claude/history.jsonl"), "{}").unwrap();
        assert!(ProjectStore::has_assistant_session(&project));
    }

    #[test]
    fn legacy_session_file_must_be_nonempty() {
        let tmp = tempdir().unwrap();
        let project = tmp.path().join("p");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join(".claude.json"), "").unwrap();
        assert!(!ProjectStore::has_assistant_session(&project));
        fs::write(project.join(".claude.json"), "{}").unwrap();
        assert!(ProjectStore::has_assistant_session(&project));
    }

    #[test]
    fn expert_workspace_seeds_task_file() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        fs::create_dir_all(s.projects_dir()).unwrap();
        let dir = s
            .expert_workspace("refactor the parser", Some("abc123"))
            .unwrap();
        assert_eq!(dir.file_name().unwrap().to_string_lossy(), "expert-abc123");

        let seed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("task.json")).unwrap()).unwrap();
        assert_eq!(seed["task"], "refactor the parser");
        assert!(seed["created"].is_string());
    }

    #[test]
    fn expert_workspace_falls_back_to_timestamp_name() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        fs::create_dir_all(s.projects_dir()).unwrap();
        let dir = s.expert_workspace("triage the backlog", None).unwrap();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("expert-"), "unexpected name: {name}");
        assert!(name.len() > "expert-".len());
        assert!(dir.join("task.json").is_file());
    }
}
