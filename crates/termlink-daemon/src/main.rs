//! termlinkd - terminal session daemon
//!
//! Owns the WebSocket endpoint. Each client connection gets its own
//! PTY-backed shell session in the last-used project directory.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use termlink_core::{ProjectStore, TerminalServer};
use tracing::{info, warn};

/// Daemon configuration, resolved from environment variables with defaults.
#[derive(Debug, Clone)]
struct DaemonConfig {
    port: u16,
    home: PathBuf,
    projects_dir: PathBuf,
    shell: String,
}

impl DaemonConfig {
    fn from_env() -> Self {
        let home = std::env::var("TERMLINK_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home().join(".termlink"));
        let projects_dir = std::env::var("TERMLINK_PROJECTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home().join("projects"));
        let port = std::env::var("TERMLINK_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8081);
        let shell = std::env::var("TERMLINK_SHELL")
            .or_else(|_| std::env::var("SHELL"))
            .unwrap_or_else(|_| "/bin/bash".to_string());
        Self {
            port,
            home,
            projects_dir,
            shell,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("TERMLINK_LOG_LEVEL") {
        v
    } else {
        "info".to_string()
    };
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_env();
    std::fs::create_dir_all(&config.home)
        .with_context(|| format!("create {}", config.home.display()))?;

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = config.home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "termlinkd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    // Panic hook: mirror panics into the tracing log file so crashes are
    // diagnosable even when stderr was not captured.
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {location}: {payload}");
        tracing::error!(location = %location, "DAEMON PANIC: {payload}");
    }));

    let store = ProjectStore::new(&config.home, config.projects_dir.clone(), default_home());
    match store.ensure_default_project() {
        Ok(path) => info!(path = %path.display(), "projects ready"),
        Err(e) => warn!(error = %e, "could not seed default project"),
    }

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let server = TerminalServer::new(addr, store, config.shell.clone());
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            let _ = shutdown.send(());
        }
    });

    info!(port = config.port, shell = %config.shell, "termlinkd starting");
    server.run().await
}
