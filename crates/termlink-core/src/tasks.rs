//! One-shot task queue.
//!
//! Holds queued commands in FIFO order and runs them one at a time as
//! detached subprocesses, independent of the interactive PTY. A task is
//! removed from the queue before it runs, so the queue snapshot always
//! shows strictly pending work.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A queued one-shot command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(command: impl Into<String>, cwd: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            cwd,
            status: TaskStatus::Pending,
        }
    }
}

/// Output captured from a finished task.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task: Task,
    pub stdout: String,
    pub stderr: String,
}

/// FIFO queue of one-shot tasks for a single session.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<Task>,
    /// Directory tasks run in when they carry no cwd of their own.
    default_cwd: Option<PathBuf>,
}

impl TaskQueue {
    pub fn new(default_cwd: Option<PathBuf>) -> Self {
        Self {
            pending: VecDeque::new(),
            default_cwd,
        }
    }

    pub fn set_default_cwd(&mut self, cwd: PathBuf) {
        self.default_cwd = Some(cwd);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append a task and return the updated queue snapshot.
    pub fn enqueue(&mut self, task: Task) -> Vec<Task> {
        debug!(task_id = %task.id, command = %task.command, "task queued");
        self.pending.push_back(task);
        self.snapshot()
    }

    /// Pending tasks in execution order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.pending.iter().cloned().collect()
    }

    /// Remove the head of the queue. The caller runs it; the queue no
    /// longer lists it while it executes.
    pub fn pop_next(&mut self) -> Option<Task> {
        self.pending.pop_front()
    }

    pub fn default_cwd(&self) -> Option<PathBuf> {
        self.default_cwd.clone()
    }

    /// Run the next pending task to completion. Returns `Ok(None)` when the
    /// queue is empty. A spawn failure or nonzero exit surfaces as
    /// [`SessionError::TaskExecution`] with the captured error text; the
    /// queue itself is unaffected and later tasks remain runnable.
    pub async fn execute_next(&mut self) -> Result<Option<TaskOutput>> {
        let Some(task) = self.pop_next() else {
            return Ok(None);
        };
        run_task(task, self.default_cwd.clone()).await.map(Some)
    }
}

/// Run one task as a detached subprocess. Standalone so a caller can pop a
/// task from the queue and run it on a spawned tokio task, keeping the
/// queue itself free for snapshots while the command executes.
pub async fn run_task(mut task: Task, fallback_cwd: Option<PathBuf>) -> Result<TaskOutput> {
    task.status = TaskStatus::Running;

    let cwd = task
        .cwd
        .clone()
        .or(fallback_cwd)
        .unwrap_or_else(|| PathBuf::from("."));

    info!(task_id = %task.id, command = %task.command, cwd = %cwd.display(), "executing task");

    let output = Command::new("sh")
        .arg("-c")
        .arg(&task.command)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SessionError::task(format!("failed to start `{}`: {e}", task.command)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        task.status = TaskStatus::Failed;
        let code = output.status.code().unwrap_or(-1);
        warn!(task_id = %task.id, code, "task failed");
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(SessionError::task(format!(
            "`{}` exited with code {code}: {detail}",
            task.command
        )));
    }

    task.status = TaskStatus::Completed;
    info!(task_id = %task.id, "task completed");
    Ok(TaskOutput {
        task,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_returns_fifo_snapshot() {
        let mut q = TaskQueue::new(None);
        q.enqueue(Task::new("echo a", None));
        let snap = q.enqueue(Task::new("echo b", None));
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].command, "echo a");
        assert_eq!(snap[1].command, "echo b");
        assert!(snap.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn pop_removes_head_before_execution() {
        let mut q = TaskQueue::new(None);
        q.enqueue(Task::new("echo a", None));
        q.enqueue(Task::new("echo b", None));
        let head = q.pop_next().unwrap();
        assert_eq!(head.command, "echo a");
        // Queue snapshot taken mid-execution shows only pending work.
        assert_eq!(q.snapshot().len(), 1);
        assert_eq!(q.snapshot()[0].command, "echo b");
    }

    #[tokio::test]
    async fn executes_tasks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = TaskQueue::new(Some(dir.path().to_path_buf()));
        q.enqueue(Task::new("printf first", None));
        q.enqueue(Task::new("printf second", None));

        let out1 = q.execute_next().await.unwrap().unwrap();
        let out2 = q.execute_next().await.unwrap().unwrap();
        assert_eq!(out1.stdout, "first");
        assert_eq!(out2.stdout, "second");
        assert_eq!(out1.task.status, TaskStatus::Completed);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop() {
        let mut q = TaskQueue::new(None);
        assert!(q.execute_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_task_error_and_queue_continues() {
        let mut q = TaskQueue::new(None);
        q.enqueue(Task::new("sh -c 'echo boom >&2; exit 3'", None));
        q.enqueue(Task::new("printf survivor", None));

        let err = q.execute_next().await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("code 3"), "unexpected error: {text}");
        assert!(text.contains("boom"), "unexpected error: {text}");

        // Failure of one task never stalls the queue.
        let out = q.execute_next().await.unwrap().unwrap();
        assert_eq!(out.stdout, "survivor");
    }

    #[tokio::test]
    async fn task_cwd_overrides_default() {
        let default_dir = tempfile::tempdir().unwrap();
        let task_dir = tempfile::tempdir().unwrap();
        let mut q = TaskQueue::new(Some(default_dir.path().to_path_buf()));
        q.enqueue(Task::new("pwd", Some(task_dir.path().to_path_buf())));

        let out = q.execute_next().await.unwrap().unwrap();
        let printed = out.stdout.trim();
        let expected = task_dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(printed).canonicalize().unwrap(),
            expected
        );
    }
}
