// vidswarm - control_client.rs

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::metadata::{FileRecord, PeerIdentity};
use crate::protocol::{
    read_json_line, write_json_line, ChunkHeader, ControlRequest, ControlResponse, ProtocolError,
    MAX_CATALOG_LINE, MAX_HEADER_LINE,
};

/// A chunk as returned by a peer: the header it declared plus exactly `length_bytes` of data.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub header: ChunkHeader,
    pub data: Bytes,
}

/// Client role of the control protocol. Each call opens its own connection, sends one request
/// and reads one response.
#[derive(Debug, Clone, Default)]
pub struct ControlClient;

impl ControlClient {
    pub fn new() -> Self {
        ControlClient
    }

    /// Asks `peer` for its full catalog.
    pub async fn fetch_catalog(&self, peer: &PeerIdentity, timeout: Duration) -> Result<Vec<FileRecord>, ProtocolError> {
        let addr = peer.control_addr();
        let mut stream = connect(addr, timeout).await?;
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);

        within(addr, timeout, write_json_line(&mut writer, &ControlRequest::Catalog)).await?;
        let line = within(addr, timeout, read_json_line(&mut reader, MAX_CATALOG_LINE))
            .await?
            .ok_or(ProtocolError::NoResponse)?;

        match ControlResponse::decode(&line)? {
            ControlResponse::Catalog { files } => {
                debug!(peer = %peer.id, files = files.len(), "Catalog received");
                Ok(files)
            }
            ControlResponse::Error { message } => Err(ProtocolError::Remote(message)),
            ControlResponse::Chunk(_) => Err(ProtocolError::UnexpectedResponse("CHUNK_RESPONSE".into())),
        }
    }

    /// Requests one chunk of `content_hash` from `peer`.
    ///
    /// Fails if the peer answers with an error, or if the stream ends before the declared number
    /// of payload bytes arrived.
    pub async fn fetch_chunk(
        &self,
        peer: &PeerIdentity,
        content_hash: &str,
        chunk_index: u32,
        timeout: Duration,
    ) -> Result<ChunkPayload, ProtocolError> {
        let addr = peer.control_addr();
        let mut stream = connect(addr, timeout).await?;
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);

        let request = ControlRequest::Chunk {
            content_hash: content_hash.to_string(),
            chunk_index,
        };
        within(addr, timeout, write_json_line(&mut writer, &request)).await?;
        let line = within(addr, timeout, read_json_line(&mut reader, MAX_HEADER_LINE))
            .await?
            .ok_or(ProtocolError::NoResponse)?;

        let header = match ControlResponse::decode(&line)? {
            ControlResponse::Chunk(header) => header,
            ControlResponse::Error { message } => return Err(ProtocolError::Remote(message)),
            ControlResponse::Catalog { .. } => {
                return Err(ProtocolError::UnexpectedResponse("CATALOG_RESPONSE".into()))
            }
        };

        let expected = header.length_bytes as usize;
        let mut data = vec![0u8; expected];
        let got = within(addr, timeout, read_up_to(&mut reader, &mut data)).await?;
        if got != expected {
            return Err(ProtocolError::IncompleteChunk { expected, got });
        }
        writer.shutdown().await.ok();

        Ok(ChunkPayload {
            header,
            data: Bytes::from(data),
        })
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ProtocolError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(ProtocolError::ConnectTimeout(addr)),
    }
}

async fn within<T, F>(addr: SocketAddr, timeout: Duration, op: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    tokio::time::timeout(timeout, op)
        .await
        .map_err(|_| ProtocolError::ReadTimeout(addr))?
}

/// Fills `buf` until it is full or the stream ends, returning how many bytes arrived.
async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
