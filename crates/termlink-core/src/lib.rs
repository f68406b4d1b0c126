//! Terminal session bridge: PTY-backed shell sessions exposed over a
//! JSON-message WebSocket transport, with heuristic detection of
//! interactive assistant prompts in the output stream.

pub mod classify;
pub mod client;
pub mod error;
pub mod fsview;
pub mod project;
pub mod protocol;
pub mod pty;
pub mod sanitize;
pub mod server;
pub mod tasks;

pub use classify::{ClassifierPolicy, PromptClassifier, PromptEvent, RunStateDetector};
pub use client::{ClientConfig, ClientEvent, OutputWindow, ReconnectPolicy, TerminalClient};
pub use error::{Result, SessionError};
pub use project::{LastProjectPointer, Project, ProjectStore};
pub use protocol::{ClientMessage, ProjectRef, ServerMessage, TaskSpec};
pub use pty::{PtySession, PtySessionOptions, SessionEvent};
pub use server::TerminalServer;
pub use tasks::{Task, TaskQueue, TaskStatus};
