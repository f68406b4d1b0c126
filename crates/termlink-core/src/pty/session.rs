//! Interactive PTY session.
//!
//! One shell process per session, hosted on a real PTY via portable-pty.
//! Raw output chunks are broadcast to subscribers in read order; no terminal
//! emulation happens on the server side. Clients interpret the byte stream.

use std::collections::HashMap;
use std::io::{Read, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::termination::Termination;
use crate::error::{Result, SessionError};

/// Delay between command text and the carriage return, giving line-edited
/// TUIs time to ingest the paste before the submit key arrives.
const SUBMIT_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PtySessionOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtySessionOptions {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: HashMap::new(),
            cols: 120,
            rows: 30,
        }
    }
}

/// Events emitted by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw output chunk, in read order.
    Data(Vec<u8>),
    /// Process exited with the given code.
    Exit(i32),
}

/// A live PTY-backed shell session.
pub struct PtySession {
    pub id: String,
    pub cwd: PathBuf,

    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn IoWrite + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    running: Arc<AtomicBool>,
    termination: Mutex<Termination>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl PtySession {
    /// Spawn the shell on a fresh PTY. A spawn failure is fatal to session
    /// creation; nothing is registered and no reader tasks are started.
    pub fn spawn(options: PtySessionOptions) -> Result<Self> {
        let id = format!(
            "session-{}-{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().to_string()[..8]
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::spawn(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.cwd(&options.cwd);
        // CommandBuilder starts with an empty env; inherit ours, then adjust.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        // A nested multiplexer would hijack the session.
        cmd.env_remove("TMUX");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::spawn(format!("{}: {e}", options.shell)))?;
        let pid = child.process_id();
        info!(session = %id, shell = %options.shell, cwd = %options.cwd.display(), pid, "session spawned");

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::spawn(format!("take writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::spawn(format!("clone reader: {e}")))?;
        let killer = child.clone_killer();

        let (event_tx, _) = broadcast::channel(1024);
        let running = Arc::new(AtomicBool::new(true));

        Self::spawn_read_loop(reader, event_tx.clone(), Arc::clone(&running));
        Self::spawn_exit_watcher(child, event_tx.clone(), Arc::clone(&running), id.clone());

        Ok(Self {
            id,
            cwd: options.cwd,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            pid,
            running,
            termination: Mutex::new(Termination::default()),
            event_tx,
        })
    }

    /// Blocking PTY reads bridged onto the runtime. Chunks are broadcast in
    /// the order they were read, so subscriber order matches process output.
    fn spawn_read_loop(
        reader: Box<dyn Read + Send>,
        event_tx: broadcast::Sender<SessionEvent>,
        running: Arc<AtomicBool>,
    ) {
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            while running.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = event_tx.send(SessionEvent::Data(buf[..n].to_vec()));
                    }
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            error!(error = %e, "pty read failed");
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Wait for child exit in the background. Exit is logged, never an error.
    fn spawn_exit_watcher(
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        event_tx: broadcast::Sender<SessionEvent>,
        running: Arc<AtomicBool>,
        session_id: String,
    ) {
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait())
                .await
                .ok()
                .and_then(|r| r.ok());
            let code = status.map(|s| s.exit_code() as i32).unwrap_or(-1);
            running.store(false, Ordering::SeqCst);
            info!(session = %session_id, code, "session exited");
            let _ = event_tx.send(SessionEvent::Exit(code));
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Write raw bytes to the PTY. A failed write marks the session defunct;
    /// callers log it and move on, per the session error contract.
    pub async fn write(&self, data: &str) -> Result<()> {
        if !self.is_running() {
            return Err(SessionError::Write {
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session not running"),
            });
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                SessionError::Write { source: e }
            })?;
        debug!(session = %self.id, len = data.len(), "pty write");
        Ok(())
    }

    /// Submit a command line: text first, then the carriage return after a
    /// short delay so the receiving program sees a completed paste.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        self.write(command).await?;
        tokio::time::sleep(SUBMIT_DELAY).await;
        self.write("\r").await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::transport(format!("resize: {e}")))?;
        debug!(session = %self.id, cols, rows, "pty resized");
        Ok(())
    }

    /// Two-phase shutdown: graceful signal, bounded grace period, then force
    /// kill. Idempotent; concurrent calls signal the process at most once.
    pub async fn terminate(&self) {
        let now = Instant::now();
        let grace = {
            let mut t = self.termination.lock().await;
            if !self.is_running() {
                t.on_exit();
                return;
            }
            if !t.begin(now) {
                return;
            }
            t.deadline().map(|d| d - now).unwrap_or(Duration::ZERO)
        };

        // Subscribe before signaling so the exit event cannot be missed.
        let mut rx = self.subscribe();
        self.signal_term();

        let exited = timeout(grace, async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Exit(_)) => break true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break true,
                }
            }
        })
        .await
        .unwrap_or(false);

        let mut t = self.termination.lock().await;
        if exited {
            t.on_exit();
            info!(session = %self.id, "session terminated gracefully");
            return;
        }
        if t.should_force_kill(Instant::now()) {
            warn!(session = %self.id, "grace period elapsed, force killing");
            if let Err(e) = self.killer.lock().await.kill() {
                error!(session = %self.id, error = %e, "force kill failed");
            }
            self.running.store(false, Ordering::SeqCst);
            t.mark_killed();
        }
    }

    #[cfg(unix)]
    fn signal_term(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(session = %self.id, error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&self) {}
}
