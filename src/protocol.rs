// vidswarm - protocol.rs
//
// Every message is a single JSON object terminated by '\n'. The only exception is chunk payload,
// which follows its CHUNK_RESPONSE header on the same stream with no delimiter.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::metadata::FileRecord;

/// Cap for requests and chunk headers.
pub const MAX_HEADER_LINE: usize = 64 * 1024;
/// Cap for catalog responses, which carry a whole file list.
pub const MAX_CATALOG_LINE: usize = 1024 * 1024;

pub const ANNOUNCE: &str = "ANNOUNCE";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connecting to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("Timed out waiting for {0}")]
    ReadTimeout(SocketAddr),
    #[error("Message exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("Connection closed before a response arrived")]
    NoResponse,
    #[error("Peer returned an error: {0}")]
    Remote(String),
    #[error("Unexpected response type: {0:?}")]
    UnexpectedResponse(String),
    #[error("Unknown request type: {0}")]
    UnknownRequest(String),
    #[error("Request has no type")]
    MissingType,
    #[error("Incomplete chunk: expected {expected} bytes, got {got}")]
    IncompleteChunk { expected: usize, got: usize },
    #[error("Chunk {index} is {got} bytes long, expected {expected}")]
    UnexpectedLength { index: u32, expected: u64, got: u64 },
}

/// A multicast announcement. `peer_id` and `message_id` are optional on the wire so that
/// incomplete datagrams decode and can be discarded instead of failing as malformed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: Option<String>,
    pub peer_id: Option<String>,
    pub peer_name: Option<String>,
    #[serde(default)]
    pub control_port: u16,
    #[serde(default)]
    pub epoch_ms: i64,
}

impl DiscoveryMessage {
    /// A fresh announcement with a new message id, stamped with the current time.
    pub fn announce(peer_id: &str, peer_name: &str, control_port: u16) -> Self {
        Self {
            kind: ANNOUNCE.to_string(),
            message_id: Some(Uuid::new_v4().to_string()),
            peer_id: Some(peer_id.to_string()),
            peer_name: Some(peer_name.to_string()),
            control_port,
            epoch_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(datagram)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlRequest {
    #[serde(rename = "CATALOG_REQUEST")]
    Catalog,
    #[serde(rename = "CHUNK_REQUEST", rename_all = "camelCase")]
    Chunk { content_hash: String, chunk_index: u32 },
}

impl ControlRequest {
    /// Decodes a request line. Unrecognised types are reported so the server can answer with an
    /// error response.
    pub fn decode(line: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(line)?;
        match value.get("type").and_then(Value::as_str) {
            None => Err(ProtocolError::MissingType),
            Some("CATALOG_REQUEST") | Some("CHUNK_REQUEST") => Ok(serde_json::from_value(value)?),
            Some(other) => Err(ProtocolError::UnknownRequest(other.to_string())),
        }
    }
}

/// Header preceding `length_bytes` of raw chunk payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub content_hash: String,
    pub chunk_index: u32,
    pub length_bytes: u32,
    pub file_size_bytes: u64,
    pub num_chunks: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlResponse {
    #[serde(rename = "CATALOG_RESPONSE")]
    Catalog { files: Vec<FileRecord> },
    #[serde(rename = "CHUNK_RESPONSE")]
    Chunk(ChunkHeader),
    #[serde(rename = "ERROR")]
    Error { message: String },
}

impl ControlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error { message: message.into() }
    }

    pub fn decode(line: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(line)?;
        match value.get("type").and_then(Value::as_str) {
            Some("CATALOG_RESPONSE") | Some("CHUNK_RESPONSE") | Some("ERROR") => {
                Ok(serde_json::from_value(value)?)
            }
            other => Err(ProtocolError::UnexpectedResponse(other.unwrap_or_default().to_string())),
        }
    }
}

/// Serializes `message` and writes it followed by a newline.
pub async fn write_json_line<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one line without its terminator. `None` means the stream ended before any byte arrived.
/// A final line without a newline is accepted.
pub async fn read_json_line<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(max_bytes as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > max_bytes {
        return Err(ProtocolError::LineTooLong(max_bytes));
    }
    Ok(Some(line))
}
