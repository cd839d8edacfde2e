//! IPC protocol for tsmd control socket
//!
//! Defines request/response types for CLI ↔ daemon communication. Each
//! message is MessagePack, preceded by its length as a big-endian u32.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::backup::BackupRecord;

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ping (health check)
    Ping,
    /// Game server running flag and status line
    Status,
    /// All backups, newest first
    ListBackups,
    /// Archive path of one backup
    BackupPath { id: u64 },
    /// Stop and start the game server
    Restart,
    /// Take a backup now
    Backup { comment: String },
    /// Replace the save with a backup
    Restore { id: u64 },
    /// Run the update command
    Update,
    /// Stop the game server and the daemon
    Shutdown,
}

/// Backup info returned by list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: u64,
    pub name: String,
    pub comment: String,
    pub path: PathBuf,
    /// Unix seconds
    pub created_at: i64,
}

impl From<BackupRecord> for BackupInfo {
    fn from(record: BackupRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            comment: record.comment,
            path: record.path,
            created_at: record.created_at,
        }
    }
}

/// Response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Success with no data
    Ok,
    /// Pong (response to ping)
    Pong,
    Status { running: bool, status: String },
    Backups(Vec<BackupInfo>),
    BackupPath(PathBuf),
    /// Backup created
    BackupCreated(u64),
    /// Error with message
    Error(String),
}

/// Read one length-prefixed message
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}

/// Write one length-prefixed message
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = rmp_serde::to_vec(message)?;
    let len = u32::try_from(buf.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(ProtocolError::FrameTooLarge(u32::MAX))?;
    writer.write_u32(len).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Send one request to the daemon at `socket` and wait for the response
pub async fn call(socket: &Path, request: &Request) -> Result<Response, ProtocolError> {
    let mut stream = UnixStream::connect(socket).await?;
    write_frame(&mut stream, request).await?;
    read_frame(&mut stream).await
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
}

impl ProtocolError {
    /// Nothing is listening on the socket
    pub fn is_daemon_unreachable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused)
        )
    }
}
