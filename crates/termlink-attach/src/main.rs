//! termlink-attach - terminal attach CLI
//!
//! Attaches the local terminal to a daemon session, like `tmux attach`.
//! Raw PTY output goes to stdout; prompt-pending notices from the
//! classifier go to stderr so they survive scrollback.
//!
//! Usage:
//!   termlink-attach
//!   termlink-attach --host myhost --port 8081

use std::io::{stdout, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use termlink_core::protocol::ClientMessage;
use termlink_core::{ClientConfig, ClientEvent, TerminalClient};
use tokio::sync::mpsc;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8081;

#[derive(Parser, Debug)]
#[command(name = "termlink-attach")]
#[command(about = "Attach to a termlink terminal session")]
#[command(version)]
struct Args {
    /// Daemon host
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Daemon port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

/// Keyboard reader on a blocking thread; keys become terminal messages.
/// Ctrl+Q detaches.
fn spawn_keyboard(
    running: Arc<AtomicBool>,
    input_tx: mpsc::Sender<ClientMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = enable_raw_mode() {
            eprintln!("\x1b[31mFailed to enable raw mode: {e}\x1b[0m");
            return;
        }

        while running.load(Ordering::SeqCst) {
            if event::poll(std::time::Duration::from_millis(100)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.modifiers.contains(KeyModifiers::CONTROL)
                        && key.code == KeyCode::Char('q')
                    {
                        eprintln!("\r\n\x1b[33mDetaching (session continues running)\x1b[0m");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }

                    let data = match key.code {
                        KeyCode::Char(c) => {
                            if key.modifiers.contains(KeyModifiers::CONTROL) {
                                let ctrl = (c.to_ascii_lowercase() as u8 - b'a' + 1) as char;
                                ctrl.to_string()
                            } else {
                                c.to_string()
                            }
                        }
                        KeyCode::Enter => "\r".to_string(),
                        KeyCode::Backspace => "\x7f".to_string(),
                        KeyCode::Tab => "\t".to_string(),
                        KeyCode::Esc => "\x1b".to_string(),
                        KeyCode::Up => "\x1b[A".to_string(),
                        KeyCode::Down => "\x1b[B".to_string(),
                        KeyCode::Right => "\x1b[C".to_string(),
                        KeyCode::Left => "\x1b[D".to_string(),
                        KeyCode::Home => "\x1b[H".to_string(),
                        KeyCode::End => "\x1b[F".to_string(),
                        KeyCode::PageUp => "\x1b[5~".to_string(),
                        KeyCode::PageDown => "\x1b[6~".to_string(),
                        KeyCode::Delete => "\x1b[3~".to_string(),
                        _ => continue,
                    };

                    if input_tx.blocking_send(ClientMessage::Terminal { data }).is_err() {
                        break;
                    }
                }
            }
        }

        let _ = disable_raw_mode();
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let url = format!("ws://{}:{}", args.host, args.port);

    eprintln!("\x1b[90mConnecting to {url}...\x1b[0m");

    let client = TerminalClient::new(ClientConfig::new(&url));
    let mut events = client.subscribe();

    let running = Arc::new(AtomicBool::new(true));
    let (input_tx, input_rx) = mpsc::channel::<ClientMessage>(64);
    let keyboard = spawn_keyboard(Arc::clone(&running), input_tx);

    let result = tokio::select! {
        run = client.run(input_rx) => run,

        printer = async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Connected { terminal_id, initial_project }) => {
                        match initial_project {
                            Some(project) => eprintln!(
                                "\x1b[32mAttached to terminal {terminal_id} in {} ({})\x1b[0m",
                                project.name,
                                project.path.display()
                            ),
                            None => eprintln!(
                                "\x1b[32mAttached to terminal {terminal_id}\x1b[0m"
                            ),
                        }
                        eprintln!("\x1b[90mPress Ctrl+Q to detach\x1b[0m\r\n");
                    }
                    Ok(ClientEvent::Terminal { data }) => {
                        print!("{data}");
                        stdout().flush()?;
                    }
                    Ok(ClientEvent::PromptPending { text }) => {
                        let first = text.lines().next().unwrap_or("");
                        eprintln!("\r\n\x1b[33m[prompt waiting] {first}\x1b[0m");
                    }
                    Ok(ClientEvent::PromptCleared) => {
                        eprintln!("\r\n\x1b[90m[prompt cleared]\x1b[0m");
                    }
                    Ok(ClientEvent::Disconnected { retrying: true }) => {
                        eprintln!("\r\n\x1b[33mConnection lost, reconnecting...\x1b[0m");
                    }
                    Ok(ClientEvent::Disconnected { retrying: false }) => {
                        eprintln!("\r\n\x1b[33mDisconnected\x1b[0m");
                        return Ok::<_, anyhow::Error>(());
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        } => printer,

        _ = tokio::signal::ctrl_c() => {
            eprintln!("\r\n\x1b[33mDetaching...\x1b[0m");
            Ok(())
        }
    };

    running.store(false, Ordering::SeqCst);
    let _ = keyboard.await;

    if let Err(e) = result {
        eprintln!("\x1b[31mError: {e}\x1b[0m");
        std::process::exit(1);
    }
    Ok(())
}
