//! Reconnecting client transport.
//!
//! Maintains one logical connection to the daemon. An abnormal close earns
//! exactly one delayed retry; a clean close (code 1000) means the server is
//! done with us and there is no retry. Received terminal chunks run through
//! the sanitizer and prompt classifier before they reach subscribers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::classify::{ClassifierPolicy, PromptClassifier, PromptEvent, RunStateDetector};
use crate::protocol::{ClientMessage, ProjectRef, ServerMessage};
use crate::sanitize::sanitize_lines;

const KEEPALIVE: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(3);
const WINDOW_CAPACITY: usize = 5;

/// Retry decision after a connection closes. One retry per disconnect,
/// never after a clean close.
#[derive(Debug)]
pub struct ReconnectPolicy {
    delay: Duration,
    attempted: bool,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempted: false,
        }
    }

    /// Called when the connection closes. `clean` means the server closed
    /// with code 1000.
    pub fn after_close(&mut self, clean: bool) -> Option<Duration> {
        if clean || self.attempted {
            return None;
        }
        self.attempted = true;
        Some(self.delay)
    }

    /// A successful connection re-arms the single retry.
    pub fn reset(&mut self) {
        self.attempted = false;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(RETRY_DELAY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub is_prompt: bool,
}

/// Bounded window over recent meaningful output lines.
#[derive(Debug)]
pub struct OutputWindow {
    lines: VecDeque<OutputLine>,
    capacity: usize,
}

impl OutputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: OutputLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Flag the most recent line as the detected prompt.
    pub fn mark_last_prompt(&mut self) {
        if let Some(last) = self.lines.back_mut() {
            last.is_prompt = true;
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for OutputWindow {
    fn default() -> Self {
        Self::new(WINDOW_CAPACITY)
    }
}

/// Events surfaced to client consumers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected {
        terminal_id: String,
        initial_project: Option<ProjectRef>,
    },
    /// Connection lost; `retrying` says whether a reconnect is scheduled.
    Disconnected {
        retrying: bool,
    },
    /// Raw terminal chunk, unmodified.
    Terminal {
        data: String,
    },
    /// A sanitized output line entered the window.
    Line(OutputLine),
    /// The assistant is blocked on an interactive prompt.
    PromptPending {
        text: String,
    },
    /// The pending prompt resolved or went stale.
    PromptCleared,
    /// Assistant running-state flipped.
    AssistantRunning(bool),
    /// Any other server message, passed through.
    Server(ServerMessage),
}

/// Sanitizer → classifier → window pipeline for received terminal chunks.
/// Pure with respect to time; the caller supplies `now`.
struct ChunkPipeline {
    classifier: PromptClassifier,
    detector: RunStateDetector,
    window: OutputWindow,
}

impl ChunkPipeline {
    fn new(policy: ClassifierPolicy) -> Self {
        Self {
            detector: RunStateDetector::new(&policy),
            classifier: PromptClassifier::new(policy),
            window: OutputWindow::default(),
        }
    }

    fn handle_chunk(&mut self, data: &str, now: Instant) -> Vec<ClientEvent> {
        let mut events = vec![ClientEvent::Terminal {
            data: data.to_string(),
        }];

        for text in sanitize_lines(data) {
            let line = OutputLine {
                text,
                is_prompt: false,
            };
            self.window.push(line.clone());
            events.push(ClientEvent::Line(line));
        }

        if let Some(running) = self.detector.observe(data) {
            events.push(ClientEvent::AssistantRunning(running));
        }

        for event in self.classifier.classify(data, now) {
            match event {
                PromptEvent::Detected { text } => {
                    self.window.mark_last_prompt();
                    events.push(ClientEvent::PromptPending { text });
                }
                PromptEvent::Resolved | PromptEvent::Expired => {
                    events.push(ClientEvent::PromptCleared);
                }
            }
        }
        events
    }

    fn poll(&mut self, now: Instant) -> Option<ClientEvent> {
        self.classifier.poll(now).map(|event| match event {
            PromptEvent::Expired | PromptEvent::Resolved => ClientEvent::PromptCleared,
            PromptEvent::Detected { text } => ClientEvent::PromptPending { text },
        })
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.classifier.next_deadline()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub keepalive: Duration,
    pub classifier: ClassifierPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keepalive: KEEPALIVE,
            classifier: ClassifierPolicy::default(),
        }
    }
}

/// One logical daemon connection with automatic single-retry reconnect.
pub struct TerminalClient {
    config: ClientConfig,
    event_tx: broadcast::Sender<ClientEvent>,
}

enum CloseKind {
    Clean,
    Abnormal,
}

impl TerminalClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { config, event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Drive the connection until it ends without a retry scheduled.
    /// Messages arriving on `input_rx` are forwarded to the daemon.
    pub async fn run(&self, mut input_rx: mpsc::Receiver<ClientMessage>) -> Result<()> {
        let mut policy = ReconnectPolicy::default();
        let mut pipeline = ChunkPipeline::new(self.config.classifier.clone());

        loop {
            match self.run_connection(&mut input_rx, &mut pipeline, &mut policy).await {
                Ok(CloseKind::Clean) => {
                    info!("server closed cleanly, not reconnecting");
                    let _ = self.event_tx.send(ClientEvent::Disconnected { retrying: false });
                    return Ok(());
                }
                Ok(CloseKind::Abnormal) | Err(_) => match policy.after_close(false) {
                    Some(delay) => {
                        warn!(delay_secs = delay.as_secs(), "connection lost, retrying once");
                        let _ = self.event_tx.send(ClientEvent::Disconnected { retrying: true });
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!("connection lost, retry already spent");
                        let _ = self.event_tx.send(ClientEvent::Disconnected { retrying: false });
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn run_connection(
        &self,
        input_rx: &mut mpsc::Receiver<ClientMessage>,
        pipeline: &mut ChunkPipeline,
        policy: &mut ReconnectPolicy,
    ) -> Result<CloseKind> {
        let (ws, _) = connect_async(&self.config.url)
            .await
            .with_context(|| format!("connect {}", self.config.url))?;
        policy.reset();
        debug!(url = %self.config.url, "connected");
        let (mut sink, mut stream) = ws.split();

        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately

        loop {
            let deadline = pipeline
                .next_deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = keepalive.tick() => {
                    let json = serde_json::to_string(&ClientMessage::Ping)?;
                    sink.send(Message::Text(json)).await?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(event) = pipeline.poll(Instant::now()) {
                        let _ = self.event_tx.send(event);
                    }
                }
                outbound = input_rx.recv() => match outbound {
                    Some(msg) => {
                        let json = serde_json::to_string(&msg)?;
                        sink.send(Message::Text(json)).await?;
                    }
                    None => {
                        // Input side hung up: detach cleanly.
                        let _ = sink.close().await;
                        return Ok(CloseKind::Clean);
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => self.handle_server_message(msg, pipeline),
                            Err(e) => debug!(error = %e, "dropping unparseable server message"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let clean = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        return Ok(if clean { CloseKind::Clean } else { CloseKind::Abnormal });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        return Ok(CloseKind::Abnormal);
                    }
                    None => return Ok(CloseKind::Abnormal),
                },
            }
        }
    }

    fn handle_server_message(&self, msg: ServerMessage, pipeline: &mut ChunkPipeline) {
        match msg {
            ServerMessage::Terminal { data } => {
                for event in pipeline.handle_chunk(&data, Instant::now()) {
                    let _ = self.event_tx.send(event);
                }
            }
            ServerMessage::Connected {
                terminal_id,
                initial_project,
            } => {
                let _ = self.event_tx.send(ClientEvent::Connected {
                    terminal_id,
                    initial_project,
                });
            }
            ServerMessage::Pong => {}
            other => {
                let _ = self.event_tx.send(ClientEvent::Server(other));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_close_never_retries() {
        let mut p = ReconnectPolicy::default();
        assert_eq!(p.after_close(true), None);
        // And the retry budget is untouched afterwards.
        assert_eq!(p.after_close(false), Some(RETRY_DELAY));
    }

    #[test]
    fn abnormal_close_retries_exactly_once() {
        let mut p = ReconnectPolicy::default();
        assert_eq!(p.after_close(false), Some(RETRY_DELAY));
        assert_eq!(p.after_close(false), None);
    }

    #[test]
    fn successful_connect_rearms_the_retry() {
        let mut p = ReconnectPolicy::default();
        assert_eq!(p.after_close(false), Some(RETRY_DELAY));
        p.reset();
        assert_eq!(p.after_close(false), Some(RETRY_DELAY));
    }

    #[test]
    fn window_evicts_oldest_at_capacity() {
        let mut w = OutputWindow::new(5);
        for i in 0..7 {
            w.push(OutputLine {
                text: format!("line {i}"),
                is_prompt: false,
            });
        }
        assert_eq!(w.len(), 5);
        let texts: Vec<&str> = w.lines().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4", "line 5", "line 6"]);
    }

    #[test]
    fn window_marks_prompt_on_last_line() {
        let mut w = OutputWindow::new(5);
        w.push(OutputLine {
            text: "building".into(),
            is_prompt: false,
        });
        w.push(OutputLine {
            text: "Do you want to continue?".into(),
            is_prompt: false,
        });
        w.mark_last_prompt();
        let flags: Vec<bool> = w.lines().map(|l| l.is_prompt).collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn pipeline_detects_prompt_and_flags_window() {
        let mut p = ChunkPipeline::new(ClassifierPolicy::default());
        let now = Instant::now();
        let chunk = "Do you want to make this edit?\n❯ 1. Yes\n  2. No";

        let events = p.handle_chunk(chunk, now);
        assert!(matches!(events[0], ClientEvent::Terminal { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::PromptPending { .. })));
        assert!(p.window.lines().any(|l| l.is_prompt));
    }

    #[test]
    fn pipeline_clears_prompt_on_resolution() {
        let mut p = ChunkPipeline::new(ClassifierPolicy::default());
        let t0 = Instant::now();
        p.handle_chunk("Do you want to make this edit?\n❯ 1. Yes\n  2. No", t0);
        let events = p.handle_chunk("Edit applied", t0 + Duration::from_secs(1));
        assert!(events.iter().any(|e| matches!(e, ClientEvent::PromptCleared)));
        assert_eq!(p.next_deadline(), None);
    }

    #[test]
    fn pipeline_poll_expires_stale_prompt() {
        let mut p = ChunkPipeline::new(ClassifierPolicy::default());
        let t0 = Instant::now();
        p.handle_chunk("Do you want to make this edit?\n❯ 1. Yes\n  2. No", t0);
        assert!(p.next_deadline().is_some());

        let event = p.poll(t0 + Duration::from_secs(30));
        assert!(matches!(event, Some(ClientEvent::PromptCleared)));
        assert!(p.next_deadline().is_none());
    }

    #[test]
    fn connected_message_surfaces_terminal_id_and_project() {
        let client = TerminalClient::new(ClientConfig::new("ws://localhost:0"));
        let mut rx = client.subscribe();
        let mut pipeline = ChunkPipeline::new(ClassifierPolicy::default());

        client.handle_server_message(
            ServerMessage::Connected {
                terminal_id: "t-9".into(),
                initial_project: Some(ProjectRef {
                    name: "alpha".into(),
                    path: "/p/alpha".into(),
                }),
            },
            &mut pipeline,
        );
        match rx.try_recv() {
            Ok(ClientEvent::Connected {
                terminal_id,
                initial_project,
            }) => {
                assert_eq!(terminal_id, "t-9");
                assert_eq!(initial_project.unwrap().name, "alpha");
            }
            other => panic!("expected connected event, got {other:?}"),
        }
    }

    #[test]
    fn pipeline_filters_noise_from_window() {
        let mut p = ChunkPipeline::new(ClassifierPolicy::default());
        p.handle_chunk("╭───────╮\n%\ncompiling termlink v0.3.0\n", Instant::now());
        let texts: Vec<&str> = p.window.lines().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["compiling termlink v0.3.0"]);
    }
}
