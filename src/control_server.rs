// vidswarm - control_server.rs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::file_manager::read_chunk;
use crate::metadata::FileRecord;
use crate::protocol::{
    read_json_line, write_json_line, ChunkHeader, ControlRequest, ControlResponse, ProtocolError, MAX_HEADER_LINE,
};

/// Read-only view of the files this process serves.
pub trait CatalogSource: Send + Sync + 'static {
    fn files(&self) -> Vec<FileRecord>;
    /// Must carry `local_path` for the file to be servable.
    fn file_by_hash(&self, content_hash: &str) -> Option<FileRecord>;
}

/// How long a connection may take to deliver its request line.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Server role of the control protocol: one request per connection, each connection on its own
/// task.
pub struct ControlServer {
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds `addr` and starts accepting. Binding failures are returned to the caller.
    pub async fn start<C: CatalogSource>(addr: SocketAddr, catalog: C) -> Result<Self, std::io::Error> {
        Self::start_with_request_timeout(addr, catalog, REQUEST_TIMEOUT).await
    }

    /// Like [`ControlServer::start`], dropping connections that send no request within
    /// `request_timeout`.
    pub async fn start_with_request_timeout<C: CatalogSource>(
        addr: SocketAddr,
        catalog: C,
        request_timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Control server listening");

        let accept_task = tokio::spawn(accept_loop(listener, Arc::new(catalog), request_timeout));
        Ok(Self {
            local_addr,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }

    /// Stops accepting and aborts every connection still being served.
    pub fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            info!(local_addr = %self.local_addr, "Control server stopped");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<C: CatalogSource>(listener: TcpListener, catalog: Arc<C>, request_timeout: Duration) {
    // Dropping the set when this task is aborted aborts the handlers with it.
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, remote)) => {
                    let catalog = Arc::clone(&catalog);
                    handlers.spawn(async move {
                        if let Err(e) = handle_connection(socket, remote, catalog.as_ref(), request_timeout).await {
                            warn!(%remote, error = %e, "Control handler error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }
}

async fn handle_connection<C: CatalogSource + ?Sized>(
    mut socket: TcpStream,
    remote: SocketAddr,
    catalog: &C,
    request_timeout: Duration,
) -> Result<(), ProtocolError> {
    let (reader, writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let line = tokio::time::timeout(request_timeout, read_json_line(&mut reader, MAX_HEADER_LINE))
        .await
        .map_err(|_| ProtocolError::ReadTimeout(remote))??;
    let Some(line) = line else {
        return Ok(());
    };

    let request = match ControlRequest::decode(&line) {
        Ok(request) => request,
        Err(ProtocolError::MissingType) => return Ok(()),
        Err(ProtocolError::UnknownRequest(kind)) => {
            let reply = ControlResponse::error(format!("Unknown request type: {}", kind));
            return write_json_line(&mut writer, &reply).await;
        }
        Err(e) => return Err(e),
    };

    match request {
        ControlRequest::Catalog => {
            let files = catalog.files();
            debug!(files = files.len(), "Serving catalog");
            write_json_line(&mut writer, &ControlResponse::Catalog { files }).await?;
        }
        ControlRequest::Chunk { content_hash, chunk_index } => {
            let local = catalog
                .file_by_hash(&content_hash)
                .and_then(|record| record.local_path.clone().map(|path| (record, path)));
            let Some((record, path)) = local else {
                let reply = ControlResponse::error(format!("File not found: {}", content_hash));
                return write_json_line(&mut writer, &reply).await;
            };

            let data = read_chunk(&path, chunk_index, record.size_bytes).await?;
            let header = ChunkHeader {
                content_hash: record.content_hash.clone(),
                chunk_index,
                length_bytes: data.len() as u32,
                file_size_bytes: record.size_bytes,
                num_chunks: record.num_chunks,
            };
            write_json_line(&mut writer, &ControlResponse::Chunk(header)).await?;
            writer.write_all(&data).await?;
            writer.flush().await?;
            debug!(hash = %content_hash, chunk = chunk_index, bytes = data.len(), "Chunk served");
        }
    }

    writer.shutdown().await?;
    Ok(())
}
