//! WebSocket connection manager.
//!
//! Each accepted connection owns exactly one [`Session`]: a PTY, a task
//! queue, and a project context, created on connect and torn down on close.
//! There are no cross-connection registries; all timers and channels are
//! scoped to the connection task and die with it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fsview;
use crate::project::ProjectStore;
use crate::protocol::{
    parse_inbound, ClientMessage, ExpertSessionInfo, Inbound, ProjectRef, ServerMessage,
};
use crate::pty::{PtySession, PtySessionOptions, SessionEvent};
use crate::tasks::{self, Task, TaskQueue};

/// Per-connection session state.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pty: PtySession,
    /// Shared with spawned task executions so the queue stays snapshotable
    /// while a command runs.
    queue: Arc<Mutex<TaskQueue>>,
    store: ProjectStore,
    project_path: PathBuf,
    initial_project: Option<ProjectRef>,
}

impl Session {
    /// Create a session for a fresh connection: resolve the starting
    /// directory from the project store and spawn the shell there.
    pub fn create(store: ProjectStore, shell: String) -> crate::error::Result<Self> {
        let project_path = store.initial_directory();
        // Report a project on connect only when the session actually landed
        // in one, not when it fell back to the home directory.
        let initial_project = store
            .load_pointer()
            .filter(|p| p.path == project_path)
            .map(|p| ProjectRef {
                name: p.name,
                path: p.path,
            });
        let pty = PtySession::spawn(PtySessionOptions {
            shell,
            cwd: project_path.clone(),
            ..Default::default()
        })?;
        let queue = Arc::new(Mutex::new(TaskQueue::new(Some(project_path.clone()))));
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            pty,
            queue,
            store,
            project_path,
            initial_project,
        })
    }

    pub fn project_path(&self) -> &PathBuf {
        &self.project_path
    }

    pub fn initial_project(&self) -> Option<&ProjectRef> {
        self.initial_project.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.pty.subscribe()
    }

    pub async fn teardown(&self) {
        self.pty.terminate().await;
    }

    /// Move the live shell into a directory and wipe the viewport so the
    /// client starts clean there.
    async fn enter_directory(&self, path: &PathBuf) {
        let cd = format!("cd \"{}\"\n", path.display());
        if let Err(e) = self.pty.write(&cd).await {
            warn!(session = %self.id, error = %e, "cd write dropped");
        }
        if let Err(e) = self.pty.write("clear\n").await {
            warn!(session = %self.id, error = %e, "clear write dropped");
        }
    }

    /// Handle one inbound message, pushing any responses to `out`.
    ///
    /// Errors are contained here: a failing operation becomes an `error`
    /// message (or a log line) and the connection stays open.
    pub async fn dispatch(&mut self, msg: ClientMessage, out: &mpsc::Sender<ServerMessage>) {
        match msg {
            ClientMessage::Ping => {
                let _ = out.send(ServerMessage::Pong).await;
            }
            ClientMessage::Terminal { data } => {
                if let Err(e) = self.pty.write(&data).await {
                    // Defunct session: the client observes silence, not an error.
                    warn!(session = %self.id, error = %e, "terminal write dropped");
                }
            }
            ClientMessage::Resize { cols, rows } => {
                if let Err(e) = self.pty.resize(cols, rows).await {
                    warn!(session = %self.id, error = %e, "resize failed");
                }
            }
            ClientMessage::FileStructure { path } => {
                let dir = path.unwrap_or_else(|| self.project_path.clone());
                let reply = match fsview::list_directory(&dir) {
                    Ok(data) => ServerMessage::FileStructure { data },
                    Err(e) => ServerMessage::Error {
                        message: format!("list {}: {e}", dir.display()),
                    },
                };
                let _ = out.send(reply).await;
            }
            ClientMessage::SetProject { project } => {
                if let Err(e) = self.store.save_pointer(&project.name, &project.path) {
                    warn!(session = %self.id, error = %e, "pointer save failed");
                }
                self.enter_directory(&project.path).await;
                self.queue
                    .lock()
                    .await
                    .set_default_cwd(project.path.clone());
                self.project_path = project.path.clone();
                info!(session = %self.id, project = %project.name, "project switched");
                let _ = out.send(ServerMessage::ProjectSet { project }).await;
            }
            ClientMessage::ClaudeCommand { resume } => {
                let command = if resume && ProjectStore::has_assistant_session(&self.project_path)
                {
                    "claude --continue"
                } else {
                    "claude"
                };
                info!(session = %self.id, command, "launching assistant");
                if let Err(e) = self.pty.send_command(command).await {
                    warn!(session = %self.id, error = %e, "launch write dropped");
                    return;
                }
                let _ = out.send(ServerMessage::SwitchToTerminal).await;
            }
            ClientMessage::ExpertSession { task, session_id } => {
                match self.store.expert_workspace(&task, session_id.as_deref()) {
                    Ok(path) => {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "expert".to_string());
                        // The workspace becomes the session's current project.
                        self.enter_directory(&path).await;
                        self.queue.lock().await.set_default_cwd(path.clone());
                        self.project_path = path.clone();
                        let _ = out
                            .send(ServerMessage::ExpertSessionCreated {
                                session: ExpertSessionInfo { name, path, task },
                            })
                            .await;
                    }
                    Err(e) => {
                        let _ = out
                            .send(ServerMessage::Error {
                                message: format!("expert session: {e}"),
                            })
                            .await;
                    }
                }
            }
            ClientMessage::ReadFile { path } => {
                let reply = match fsview::read_file(&path) {
                    Ok(file) => ServerMessage::FileContent {
                        path: file.path,
                        content: file.content,
                        last_modified: file.modified,
                    },
                    Err(e) => ServerMessage::Error {
                        message: format!("read {}: {e}", path.display()),
                    },
                };
                let _ = out.send(reply).await;
            }
            ClientMessage::CheckFileModified {
                path,
                last_known_modified,
                last_known_content,
            } => {
                match fsview::check_modified(&path, last_known_modified, &last_known_content) {
                    Ok(Some(file)) => {
                        let _ = out
                            .send(ServerMessage::FileContent {
                                path: file.path,
                                content: file.content,
                                last_modified: file.modified,
                            })
                            .await;
                    }
                    // Unchanged files produce no reply; the client keeps
                    // what it has.
                    Ok(None) => debug!(session = %self.id, path = %path.display(), "file unchanged"),
                    Err(e) => {
                        let _ = out
                            .send(ServerMessage::Error {
                                message: format!("check {}: {e}", path.display()),
                            })
                            .await;
                    }
                }
            }
            ClientMessage::ClaudeTask { task } => {
                let queue = self
                    .queue
                    .lock()
                    .await
                    .enqueue(Task::new(task.command, task.cwd));
                let _ = out.send(ServerMessage::TaskQueued { queue }).await;
            }
            ClientMessage::ExecuteTask => {
                let popped = {
                    let mut queue = self.queue.lock().await;
                    queue.pop_next().map(|task| (task, queue.default_cwd()))
                };
                let Some((task, fallback_cwd)) = popped else {
                    debug!(session = %self.id, "execute on empty queue");
                    return;
                };
                // Run off the dispatch path so terminal output keeps
                // flowing while the command executes.
                let out = out.clone();
                let queue = Arc::clone(&self.queue);
                let session_id = self.id.clone();
                tokio::spawn(async move {
                    let result = tasks::run_task(task, fallback_cwd).await;
                    let snapshot = queue.lock().await.snapshot();
                    let reply = match result {
                        Ok(output) => ServerMessage::TaskComplete {
                            task: output.task,
                            stdout: output.stdout,
                            stderr: output.stderr,
                            queue: snapshot,
                        },
                        Err(e) => {
                            warn!(session = %session_id, error = %e, "task execution failed");
                            ServerMessage::TaskError {
                                message: e.to_string(),
                                queue: snapshot,
                            }
                        }
                    };
                    let _ = out.send(reply).await;
                });
            }
        }
    }
}

/// WebSocket server hosting one terminal session per connection.
pub struct TerminalServer {
    addr: SocketAddr,
    store: ProjectStore,
    shell: String,
    shutdown_tx: broadcast::Sender<()>,
}

impl TerminalServer {
    pub fn new(addr: SocketAddr, store: ProjectStore, shell: String) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            addr,
            store,
            shell,
            shutdown_tx,
        }
    }

    /// Handle for triggering a graceful shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("bind {}", self.addr))?;
        info!(addr = %self.addr, "terminal server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let store = self.store.clone();
                    let shell = self.shell.clone();
                    let mut conn_shutdown = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_connection(stream, peer, store, shell) => {
                                if let Err(e) = result {
                                    warn!(%peer, error = %e, "connection ended with error");
                                }
                            }
                            _ = conn_shutdown.recv() => {
                                debug!(%peer, "connection closed by shutdown");
                            }
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("terminal server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: ProjectStore,
    shell: String,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake")?;
    info!(%peer, "client connected");
    let (mut sink, mut ws_rx) = ws.split();

    let mut session = match Session::create(store, shell) {
        Ok(session) => session,
        Err(e) => {
            error!(%peer, error = %e, "session creation failed");
            let msg = ServerMessage::Error {
                message: e.to_string(),
            };
            let _ = sink.send(Message::Text(serde_json::to_string(&msg)?)).await;
            let _ = sink.close().await;
            return Ok(());
        }
    };

    let mut events = session.subscribe();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    out_tx
        .send(ServerMessage::Connected {
            terminal_id: session.id.clone(),
            initial_project: session.initial_project().cloned(),
        })
        .await
        .ok();

    let result: Result<()> = async {
        loop {
            tokio::select! {
                Some(msg) = out_rx.recv() => {
                    sink.send(Message::Text(serde_json::to_string(&msg)?)).await?;
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::Data(chunk)) => {
                        let msg = ServerMessage::Terminal {
                            data: String::from_utf8_lossy(&chunk).into_owned(),
                        };
                        sink.send(Message::Text(serde_json::to_string(&msg)?)).await?;
                    }
                    Ok(SessionEvent::Exit(code)) => {
                        debug!(session = %session.id, code, "pty exited, closing connection");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %session.id, skipped, "output broadcast lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match parse_inbound(&text) {
                        Inbound::Message(msg) => session.dispatch(msg, &out_tx).await,
                        Inbound::Unknown(tag) => {
                            debug!(session = %session.id, tag, "ignoring unknown message type");
                        }
                        Inbound::Malformed(err) => {
                            debug!(session = %session.id, error = %err, "dropping malformed message");
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%peer, error = %e, "websocket receive error");
                        break;
                    }
                },
            }
        }
        Ok(())
    }
    .await;

    // Teardown runs on every exit path, clean close or abrupt drop.
    session.teardown().await;
    info!(%peer, session = %session.id, "client disconnected");
    result
}
