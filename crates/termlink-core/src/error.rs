//! Session error taxonomy.
//!
//! Every error is contained to the session it occurred in; nothing here
//! crosses session boundaries. Classifier ambiguity is deliberately absent:
//! a missed or spurious prompt detection is not an error condition.

use thiserror::Error;

/// Errors produced by a terminal session and its attached subsystems.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The shell process could not be started. Fatal to session creation:
    /// no session is registered and the client receives a session-init error.
    #[error("failed to spawn session process: {message}")]
    Spawn { message: String },

    /// A write to the PTY failed (typically the process already exited).
    /// The session is marked defunct; the client observes silence.
    #[error("pty write failed: {source}")]
    Write {
        #[source]
        source: std::io::Error,
    },

    /// A malformed or undeliverable transport message. The offending
    /// message is dropped; the connection stays open.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A filesystem operation failed (project state, file view).
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A one-shot queued task failed to run or exited nonzero. Reported
    /// with the captured error text; the queue continues.
    #[error("task execution failed: {message}")]
    TaskExecution { message: String },
}

impl SessionError {
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn task(message: impl Into<String>) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
