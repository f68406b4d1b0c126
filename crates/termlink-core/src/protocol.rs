//! Wire protocol.
//!
//! One JSON object per WebSocket text message, discriminated by a `type`
//! field. Both directions use closed enums; an unknown `type` is not an
//! error, it is ignored so older clients keep working against newer daemons.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fsview::DirEntry;
use crate::tasks::Task;

/// A project reference carried on the wire: `{name, path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub name: String,
    pub path: PathBuf,
}

/// A task submission: `{command, cwd?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// An expert workspace as reported back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertSessionInfo {
    pub name: String,
    pub path: PathBuf,
    pub task: String,
}

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Keepalive; answered with `pong`.
    Ping,
    /// Raw keystrokes for the PTY.
    #[serde(rename_all = "camelCase")]
    Terminal { data: String },
    /// Viewport size change.
    #[serde(rename_all = "camelCase")]
    Resize { cols: u16, rows: u16 },
    /// Request a directory listing; defaults to the session project.
    #[serde(rename_all = "camelCase")]
    FileStructure {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Switch the session to a project directory.
    #[serde(rename_all = "camelCase")]
    SetProject { project: ProjectRef },
    /// Launch the assistant in the current project.
    #[serde(rename_all = "camelCase")]
    ClaudeCommand {
        #[serde(default)]
        resume: bool,
    },
    /// Provision a fresh workspace seeded with a task description.
    #[serde(rename_all = "camelCase")]
    ExpertSession {
        task: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReadFile { path: PathBuf },
    #[serde(rename_all = "camelCase")]
    CheckFileModified {
        path: PathBuf,
        #[serde(default)]
        last_known_modified: u64,
        #[serde(default)]
        last_known_content: String,
    },
    /// Queue a one-shot task without running it.
    #[serde(rename_all = "camelCase")]
    ClaudeTask { task: TaskSpec },
    /// Run the next queued task.
    ExecuteTask,
}

/// Messages the daemon sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        terminal_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_project: Option<ProjectRef>,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    ProjectSet { project: ProjectRef },
    /// Raw PTY output chunk.
    #[serde(rename_all = "camelCase")]
    Terminal { data: String },
    #[serde(rename_all = "camelCase")]
    TaskQueued { queue: Vec<Task> },
    #[serde(rename_all = "camelCase")]
    TaskComplete {
        task: Task,
        stdout: String,
        stderr: String,
        queue: Vec<Task>,
    },
    #[serde(rename_all = "camelCase")]
    TaskError { message: String, queue: Vec<Task> },
    /// Tells the client to foreground its terminal view.
    SwitchToTerminal,
    #[serde(rename_all = "camelCase")]
    ExpertSessionCreated { session: ExpertSessionInfo },
    #[serde(rename_all = "camelCase")]
    FileStructure { data: Vec<DirEntry> },
    #[serde(rename_all = "camelCase")]
    FileContent {
        path: PathBuf,
        content: String,
        last_modified: u64,
    },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Outcome of parsing one inbound text frame.
#[derive(Debug)]
pub enum Inbound {
    Message(ClientMessage),
    /// Well-formed JSON with a `type` this daemon does not know.
    Unknown(String),
    /// Not JSON, or JSON that does not fit the known shape.
    Malformed(String),
}

/// Parse an inbound frame, distinguishing an unknown `type` tag (forward
/// compatibility, ignored) from a malformed message (dropped with a log).
pub fn parse_inbound(raw: &str) -> Inbound {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return Inbound::Malformed(e.to_string()),
    };
    match serde_json::from_value::<ClientMessage>(value.clone()) {
        Ok(msg) => Inbound::Message(msg),
        Err(e) => {
            if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
                if e.to_string().contains("unknown variant") {
                    return Inbound::Unknown(tag.to_string());
                }
            }
            Inbound::Malformed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_type_tag() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal","data":"ls\r"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Terminal {
                data: "ls\r".to_string()
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ClientMessage::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn set_project_carries_nested_project_object() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"setProject","project":{"name":"demo","path":"/p/demo"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetProject {
                project: ProjectRef {
                    name: "demo".into(),
                    path: PathBuf::from("/p/demo"),
                }
            }
        );
    }

    #[test]
    fn claude_task_carries_nested_task_object() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"claudeTask","task":{"command":"npm test","cwd":"/p/demo"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ClaudeTask {
                task: TaskSpec {
                    command: "npm test".into(),
                    cwd: Some(PathBuf::from("/p/demo")),
                }
            }
        );
        // cwd is optional.
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"claudeTask","task":{"command":"make"}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ClaudeTask { task } if task.cwd.is_none()));
    }

    #[test]
    fn check_file_modified_uses_last_known_field_names() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"checkFileModified","path":"/tmp/a","lastKnownModified":123,"lastKnownContent":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::CheckFileModified {
                path: PathBuf::from("/tmp/a"),
                last_known_modified: 123,
                last_known_content: "x".into(),
            }
        );
        // Both comparison fields default when absent.
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"checkFileModified","path":"/tmp/a"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::CheckFileModified { last_known_modified: 0, .. }
        ));
    }

    #[test]
    fn expert_session_accepts_optional_session_id() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"expertSession","task":"review","sessionId":"abc123"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ExpertSession {
                task: "review".into(),
                session_id: Some("abc123".into()),
            }
        );
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"expertSession","task":"review"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ExpertSession { session_id: None, .. }));
    }

    #[test]
    fn camel_case_field_names_on_the_wire() {
        let out = serde_json::to_value(ServerMessage::SwitchToTerminal).unwrap();
        assert_eq!(out["type"], "switchToTerminal");

        let out = serde_json::to_value(ServerMessage::FileContent {
            path: PathBuf::from("/tmp/a"),
            content: "x".into(),
            last_modified: 99,
        })
        .unwrap();
        assert_eq!(out["lastModified"], 99);
    }

    #[test]
    fn claude_command_resume_defaults_false() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"claudeCommand"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ClaudeCommand { resume: false });
    }

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        assert!(matches!(
            parse_inbound(r#"{"type":"holographicDisplay","data":1}"#),
            Inbound::Unknown(tag) if tag == "holographicDisplay"
        ));
        assert!(matches!(parse_inbound("not json at all"), Inbound::Malformed(_)));
        // Known tag with missing required fields is malformed, not unknown.
        assert!(matches!(
            parse_inbound(r#"{"type":"resize","cols":80}"#),
            Inbound::Malformed(_)
        ));
    }

    #[test]
    fn connected_names_terminal_id_and_optional_project() {
        let msg = ServerMessage::Connected {
            terminal_id: "t-1".into(),
            initial_project: Some(ProjectRef {
                name: "alpha".into(),
                path: PathBuf::from("/srv/projects/alpha"),
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connected""#));
        assert!(json.contains(r#""terminalId":"t-1""#));
        assert!(json.contains(r#""initialProject""#));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);

        // No project at all: the field is omitted, not null.
        let bare = serde_json::to_value(ServerMessage::Connected {
            terminal_id: "t-2".into(),
            initial_project: None,
        })
        .unwrap();
        assert!(bare.get("initialProject").is_none());
    }

    #[test]
    fn task_results_carry_queue_snapshot() {
        let remaining = vec![Task::new("echo later", None)];
        let done = Task::new("echo done", None);
        let json = serde_json::to_value(ServerMessage::TaskComplete {
            task: done,
            stdout: "done".into(),
            stderr: String::new(),
            queue: remaining.clone(),
        })
        .unwrap();
        assert_eq!(json["queue"].as_array().unwrap().len(), 1);

        let json = serde_json::to_value(ServerMessage::TaskError {
            message: "exited with code 2".into(),
            queue: remaining,
        })
        .unwrap();
        assert_eq!(json["queue"].as_array().unwrap().len(), 1);
    }
}
