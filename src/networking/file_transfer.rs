use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{read_message, write_message, Command, Message};
use crate::catalog::FileCatalog;
use crate::config::DEFAULT_TRANSFER_PORT;

/// Configuration for the transfer server
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Address to accept connections on
    pub listen_addr: SocketAddr,
    /// Upper bound on connections handled at once (None = unbounded)
    pub max_connections: Option<usize>,
    /// Deadline for one whole exchange (None = no deadline)
    pub io_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TRANSFER_PORT)),
            max_connections: None,
            io_timeout: None,
        }
    }
}

/// Resolve a requested file name inside the shared directory.
///
/// Only plain names are accepted: anything that would escape the directory
/// or address a subdirectory is refused.
pub fn shared_file_path(shared_dir: &Path, file_name: &str) -> Option<PathBuf> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if !file_name.contains(['/', '\\']) => {
            Some(shared_dir.join(name))
        }
        _ => None,
    }
}

/// Serves presence checks, catalog requests and file downloads.
///
/// Each accepted connection carries exactly one request and is closed once
/// it has been answered.
pub struct TransferServer {
    config: TransferConfig,
    catalog: Arc<FileCatalog>,
    server_address: Option<SocketAddr>,
    shutdown: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
}

impl TransferServer {
    pub fn new(config: TransferConfig, catalog: Arc<FileCatalog>) -> Self {
        Self {
            config,
            catalog,
            server_address: None,
            shutdown: None,
            accept_task: None,
        }
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// The loop stops when `cancel` (or `stop_server`) fires; handlers that
    /// are already running finish on their own.
    pub async fn start_server(&mut self, cancel: CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("not able to start tcp server on {}", self.config.listen_addr))?;
        let server_addr = listener.local_addr()?;
        self.server_address = Some(server_addr);

        info!("TCP server listening on {}...", server_addr);

        let shutdown = cancel.child_token();
        self.shutdown = Some(shutdown.clone());

        let config = self.config.clone();
        let catalog = self.catalog.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, config, catalog, shutdown)));

        Ok(server_addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn stop_server(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
            info!("Sent shutdown signal to transfer server");
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("Transfer server task failed: {}", e);
            }
        }
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server_address
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: TransferConfig,
    catalog: Arc<FileCatalog>,
    shutdown: CancellationToken,
) {
    let limiter = config.max_connections.map(|n| Arc::new(Semaphore::new(n)));

    loop {
        // Wait for a free slot first when connections are bounded
        let permit: Option<OwnedSemaphorePermit> = match &limiter {
            Some(limiter) => tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            },
        };

        info!("accepted new connection from {}...", peer);

        let catalog = catalog.clone();
        let io_timeout = config.io_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            let exchange = handle_connection(socket, peer, catalog);

            let result = match io_timeout {
                Some(limit) => match tokio::time::timeout(limit, exchange).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Connection from {} timed out after {:?}", peer, limit);
                        return;
                    }
                },
                None => exchange.await,
            };

            if let Err(e) = result {
                error!("Error handling connection from {}: {:#}", peer, e);
            }
        });
    }

    info!("Shutting down transfer server");
}

/// Decode one request, dispatch it, and close the connection.
///
/// Nothing is ever sent back for a request that fails to decode, has an
/// unknown tag, or names a file that cannot be opened.
async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    catalog: Arc<FileCatalog>,
) -> Result<()> {
    let (read_half, mut write_half) = socket.split();
    let mut reader = BufReader::new(read_half);

    let request = match read_message(&mut reader).await {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping connection from {}: {}", peer, e);
            return Ok(());
        }
    };

    match request.kind() {
        Some(Command::Ping) => {
            info!("got a PING from connection {}...", peer);
        }
        Some(Command::ListFiles) => {
            handle_list_files(&mut write_half, peer, &catalog).await?;
        }
        Some(Command::DownloadFile) => {
            handle_download_file(&mut write_half, peer, catalog.root(), &request.payload).await?;
        }
        Some(Command::ListFilesResp) | None => {
            warn!("got an unknown command from {}: {}", peer, request.command);
        }
    }

    write_half.shutdown().await.ok();
    Ok(())
}

async fn handle_list_files<W>(writer: &mut W, peer: SocketAddr, catalog: &FileCatalog) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!("got a files listing request from {}...", peer);

    let files = catalog.file_names();
    let response = Message::list_files_resp(&files)?;
    write_message(writer, &response)
        .await
        .with_context(|| format!("Failed to send file list to {}", peer))?;

    debug!("Sent {} file names to {}", files.len(), peer);
    Ok(())
}

async fn handle_download_file<W>(
    writer: &mut W,
    peer: SocketAddr,
    shared_dir: &Path,
    file_name: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!("got a file download request from {} for {}", peer, file_name);

    let Some(file_path) = shared_file_path(shared_dir, file_name) else {
        warn!("Refusing download of {:?} from {}: not a plain file name", file_name, peer);
        return Ok(());
    };

    let mut file = match File::open(&file_path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("error trying to open file {}: {}", file_path.display(), e);
            return Ok(());
        }
    };

    let sent = tokio::io::copy(&mut file, writer)
        .await
        .with_context(|| format!("error trying to send {} to {}", file_path.display(), peer))?;
    writer.flush().await?;

    info!("successfully sent {} bytes of data to {}", sent, peer);
    Ok(())
}
