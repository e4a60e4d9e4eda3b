//! Request/response envelope exchanged over the transfer port.
//!
//! Every message is a single JSON object `{"Command": .., "Payload": ..}`
//! terminated by a newline. File contents sent in reply to a download
//! request are *not* wrapped in a message: they follow as raw bytes until
//! the server closes the connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message accepted from a peer, newline included
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed before a message arrived")]
    Eof,

    #[error("message exceeds {} bytes", MAX_MESSAGE_BYTES)]
    TooLarge,
}

/// The closed set of command tags understood by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    ListFiles,
    ListFilesResp,
    DownloadFile,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::ListFiles => "LIST_FILES",
            Self::ListFilesResp => "LIST_FILES_RESP",
            Self::DownloadFile => "DOWNLOAD_FILE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PING" => Ok(Self::Ping),
            "LIST_FILES" => Ok(Self::ListFiles),
            "LIST_FILES_RESP" => Ok(Self::ListFilesResp),
            "DOWNLOAD_FILE" => Ok(Self::DownloadFile),
            other => Err(other.to_string()),
        }
    }
}

/// Wire envelope.
///
/// The tag is kept as a raw string so a message with an unknown command
/// still decodes and can be reported by name. Lowercase field names are
/// accepted on decode; encoding always uses the capitalised ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Command", alias = "command")]
    pub command: String,
    #[serde(rename = "Payload", alias = "payload", default)]
    pub payload: String,
}

impl Message {
    pub fn new(command: Command, payload: impl Into<String>) -> Self {
        Self {
            command: command.as_str().to_string(),
            payload: payload.into(),
        }
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping, "")
    }

    pub fn list_files() -> Self {
        Self::new(Command::ListFiles, "")
    }

    pub fn download_file(file_name: &str) -> Self {
        Self::new(Command::DownloadFile, file_name)
    }

    /// Catalog reply carrying the names as a JSON array inside the payload
    pub fn list_files_resp(files: &[String]) -> Result<Self, ProtocolError> {
        Ok(Self::new(Command::ListFilesResp, serde_json::to_string(files)?))
    }

    /// The recognised command, if any
    pub fn kind(&self) -> Option<Command> {
        self.command.parse().ok()
    }

    /// Decode the file list carried by a `LIST_FILES_RESP` payload
    pub fn file_list(&self) -> Result<Vec<String>, ProtocolError> {
        // Some peers encode an empty list as `null`
        let files: Option<Vec<String>> = serde_json::from_str(&self.payload)?;
        Ok(files.unwrap_or_default())
    }
}

/// Encode one message and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode exactly one message.
///
/// A message ends at the first newline; one terminated by EOF is accepted
/// too. EOF before any byte is `ProtocolError::Eof`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_MESSAGE_BYTES);
    let n = limited.read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') && n as u64 >= MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::Eof);
    }

    Ok(serde_json::from_slice(&line)?)
}
