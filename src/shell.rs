// src/shell.rs
//
// Interactive operator commands: peers, ping, list, download, exit

use anyhow::Result;
use log::{error, info, warn};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::networking::{PeerRegistry, TransferClient};

const UNKNOWN_COMMAND: &str = "Unknown command. Available: peers, ping, list, download, help, exit";

/// A parsed operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Peers,
    Ping(String),
    List(String),
    Download { peer: String, file_name: String },
    Help,
    Exit,
}

impl ShellCommand {
    /// Parse one input line.
    ///
    /// Blank input is `Ok(None)`. A missing argument or an unknown command
    /// is an `Err` carrying the message to show the operator.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return Ok(None);
        };

        let command = match (command.to_lowercase().as_str(), &parts[1..]) {
            ("peers", _) => Self::Peers,
            ("help" | "h", _) => Self::Help,
            ("exit" | "quit" | "q", _) => Self::Exit,
            ("ping", [peer, ..]) => Self::Ping(peer.to_string()),
            ("ping", []) => return Err("Usage: ping <peer_ip>".to_string()),
            ("list", [peer, ..]) => Self::List(peer.to_string()),
            ("list", []) => return Err("Usage: list <peer_ip>".to_string()),
            ("download", [peer, file_name, ..]) => Self::Download {
                peer: peer.to_string(),
                file_name: file_name.to_string(),
            },
            ("download", _) => return Err("Usage: download <peer_ip> <filename>".to_string()),
            _ => return Err(UNKNOWN_COMMAND.to_string()),
        };

        Ok(Some(command))
    }
}

/// What the shell needs to act on commands
#[derive(Clone)]
pub struct Shell {
    registry: Arc<PeerRegistry>,
    client: TransferClient,
}

impl Shell {
    pub fn new(registry: Arc<PeerRegistry>, client: TransferClient) -> Self {
        Self { registry, client }
    }

    /// Read commands from `input` until `exit`, end of input, or `cancel`.
    ///
    /// Leaving the loop cancels `cancel` so the rest of the node shuts down.
    pub async fn run(&self, mut input: mpsc::Receiver<String>, cancel: CancellationToken) -> Result<()> {
        print_help();

        loop {
            prompt();

            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = input.recv() => line,
            };

            let Some(line) = line else {
                info!("End of input, shutting down...");
                break;
            };

            match ShellCommand::parse(&line) {
                Ok(Some(ShellCommand::Exit)) => {
                    info!("Shutting down...");
                    break;
                }
                Ok(Some(command)) => {
                    // Remote operations run in the background; their outcome is logged
                    self.dispatch(command);
                }
                Ok(None) => {}
                Err(message) => warn!("{}", message),
            }
        }

        cancel.cancel();
        Ok(())
    }

    /// Execute one command. Remote operations are spawned and their handle
    /// returned; local ones complete immediately.
    pub fn dispatch(&self, command: ShellCommand) -> Option<JoinHandle<()>> {
        match command {
            ShellCommand::Peers => {
                self.show_peers();
                None
            }
            ShellCommand::Help => {
                print_help();
                None
            }
            ShellCommand::Exit => None,
            ShellCommand::Ping(peer) => {
                let client = self.client.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = client.send_ping(&peer).await {
                        error!("Ping to {} failed: {}", peer, e);
                    }
                }))
            }
            ShellCommand::List(peer) => {
                let client = self.client.clone();
                Some(tokio::spawn(async move {
                    match client.request_file_list(&peer).await {
                        Ok(files) => {
                            info!("--- here are the files from {} ---", peer);
                            for file in &files {
                                info!("  - {}", file);
                            }
                            info!("-----------------------");
                        }
                        Err(e) => error!("Listing files on {} failed: {}", peer, e),
                    }
                }))
            }
            ShellCommand::Download { peer, file_name } => {
                let client = self.client.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = client.request_file_download(&peer, &file_name).await {
                        error!("Download of '{}' from {} failed: {}", file_name, peer, e);
                    }
                }))
            }
        }
    }

    fn show_peers(&self) {
        let peers = self.registry.active_peers();
        info!("--- Currently {} peers ---", peers.len());
        for peer in &peers {
            info!("-> {}", peer);
        }
        info!("------------------------");
    }
}

/// Forward stdin lines to a channel from a dedicated thread.
///
/// A blocked terminal read never holds up runtime shutdown this way. The
/// channel closes at end of input.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Error reading input: {}", e);
                    break;
                }
            }
        }
    });

    rx
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    info!("Available commands:");
    info!("  peers                     - List peers seen recently");
    info!("  ping <peer>               - Send a presence check");
    info!("  list <peer>               - Show a peer's shared files");
    info!("  download <peer> <file>    - Fetch a file into the shared directory");
    info!("  help                      - Show this help");
    info!("  exit                      - Stop the node");
}
