use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::file_transfer::shared_file_path;
use super::protocol::{read_message, write_message, Command, Message, ProtocolError};
use crate::catalog::{CatalogError, FileCatalog};

/// Errors that can occur while talking to a peer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("could not connect to peer {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected response from peer: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("received unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("failed to rebuild file index: {0}")]
    Catalog(#[from] CatalogError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One-shot request operations against remote transfer servers.
///
/// Every call opens its own connection, performs a single exchange, and
/// closes it. Nothing is retried.
#[derive(Clone)]
pub struct TransferClient {
    port: u16,
    catalog: Arc<FileCatalog>,
}

impl TransferClient {
    /// `port` is the transfer port dialled when a peer is given as a bare
    /// host. Downloads land in the catalog's directory.
    pub fn new(port: u16, catalog: Arc<FileCatalog>) -> Self {
        Self { port, catalog }
    }

    async fn connect(&self, peer: &str) -> Result<TcpStream, TransferError> {
        let result = match peer.parse::<SocketAddr>() {
            Ok(addr) => TcpStream::connect(addr).await,
            Err(_) => TcpStream::connect((peer, self.port)).await,
        };

        result.map_err(|source| TransferError::Connect {
            addr: peer.to_string(),
            source,
        })
    }

    /// Send a presence check. No reply is expected or read.
    pub async fn send_ping(&self, peer: &str) -> Result<(), TransferError> {
        let mut stream = self.connect(peer).await?;
        write_message(&mut stream, &Message::ping()).await?;
        info!("sent command PING to {}", peer);
        Ok(())
    }

    /// Fetch the peer's file catalog
    pub async fn request_file_list(&self, peer: &str) -> Result<Vec<String>, TransferError> {
        let mut stream = self.connect(peer).await?;
        write_message(&mut stream, &Message::list_files()).await?;
        debug!("Sent 'LIST_FILES' request to {}", peer);

        let mut reader = BufReader::new(stream);
        let response = read_message(&mut reader).await?;

        match response.kind() {
            Some(Command::ListFilesResp) => Ok(response.file_list()?),
            _ => Err(TransferError::UnexpectedResponse(response.command)),
        }
    }

    /// Download `file_name` from the peer into the shared directory,
    /// returning the number of bytes received.
    ///
    /// The transfer ends when the peer closes the connection. The catalog is
    /// rebuilt afterwards whether or not the copy succeeded; a partial file
    /// is left in place.
    pub async fn request_file_download(
        &self,
        peer: &str,
        file_name: &str,
    ) -> Result<u64, TransferError> {
        let save_path = shared_file_path(self.catalog.root(), file_name)
            .ok_or_else(|| TransferError::InvalidFileName(file_name.to_string()))?;

        let mut stream = self.connect(peer).await?;
        write_message(&mut stream, &Message::download_file(file_name)).await?;
        info!("Sent 'DOWNLOAD_FILE' request for '{}' to {}", file_name, peer);

        let mut file = File::create(&save_path).await?;
        let copied = match tokio::io::copy(&mut stream, &mut file).await {
            Ok(n) => file.flush().await.map(|_| n),
            Err(e) => Err(e),
        };
        drop(file);

        let received = self.finish_download(copied).await?;

        if received == 0 {
            warn!(
                "Peer {} sent no data for '{}' (missing on the peer, or the connection dropped)",
                peer, file_name
            );
        }
        info!(
            "successfully received {} bytes and contents saved at {}",
            received,
            save_path.display()
        );
        Ok(received)
    }

    /// Rebuild the catalog after a copy has ended, then report the copy
    /// outcome. A copy error wins over a rebuild error, which is logged.
    async fn finish_download(&self, copied: io::Result<u64>) -> Result<u64, TransferError> {
        let catalog = self.catalog.clone();
        let rebuilt = match tokio::task::spawn_blocking(move || catalog.rebuild()).await {
            Ok(result) => result.map_err(TransferError::from),
            Err(e) => Err(TransferError::from(e)),
        };

        match (copied, rebuilt) {
            (Ok(received), Ok(_)) => Ok(received),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), rebuilt) => {
                if let Err(rebuild_err) = rebuilt {
                    error!("Could not rebuild file index after failed download: {}", rebuild_err);
                }
                Err(e.into())
            }
        }
    }
}
