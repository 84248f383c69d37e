//! TCP transport: framed request/response over tokio sockets
//!
//! The server runs one task per connection and answers requests on a
//! connection in order. The client keeps a small pool of idle connections,
//! bounds every call with a timeout and discards a connection after any
//! failure, reconnecting on the next call.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use blocksync_core::protocol::DEFAULT_MAX_FRAME;
use blocksync_core::service::response_error;
use blocksync_core::{
    Block, ContentHash, FileMetadata, Message, ProtocolReader, ProtocolWriter, RemoteStore,
    Service, SyncError, UpdateOutcome,
};

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connections kept per client
const DEFAULT_POOL_SIZE: usize = 8;

/// TCP server exposing a [`Service`]
pub struct TcpServer {
    listener: TcpListener,
    service: Service,
    max_frame: usize,
}

impl TcpServer {
    /// Bind to `addr`
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound
    pub async fn bind(addr: impl ToSocketAddrs, service: Service) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service,
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    /// Reject request frames larger than `max_frame` bytes
    #[must_use]
    pub fn max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// # Errors
    /// Returns an error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// # Errors
    /// Returns an error if accepting fails
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("listening on {}", self.listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };
            let _ = stream.set_nodelay(true);
            debug!(%peer, "accepted connection");

            let service = self.service.clone();
            let max_frame = self.max_frame;
            tokio::spawn(async move {
                match handle_connection(stream, service, max_frame).await {
                    Ok(()) => debug!(%peer, "connection closed"),
                    Err(e) => warn!(%peer, "connection failed: {e}"),
                }
            });
        }
    }
}

/// Answer requests on one connection until the peer disconnects
async fn handle_connection(
    stream: TcpStream,
    service: Service,
    max_frame: usize,
) -> blocksync_core::Result<()> {
    let (read, write) = stream.into_split();
    let mut reader = ProtocolReader::new(read).with_max_frame(max_frame);
    let mut writer = ProtocolWriter::new(write);

    loop {
        let request = match reader.read_message().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(SyncError::Protocol(message)) => {
                // Framing is lost; report and drop the connection
                writer.send(&Message::Error(message.clone())).await?;
                return Err(SyncError::Protocol(message));
            }
            Err(e) => return Err(e),
        };

        let name = request.name();
        let service = service.clone();
        let response = tokio::task::spawn_blocking(move || service.handle(request))
            .await
            .map_err(|e| SyncError::Store(format!("request handler panicked: {e}")))?;
        debug!(request = name, response = response.name(), "handled");
        writer.send(&response).await?;
    }
}

struct Connection {
    reader: ProtocolReader<OwnedReadHalf>,
    writer: ProtocolWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn exchange(&mut self, request: &Message) -> blocksync_core::Result<Message> {
        self.writer.send(request).await?;
        self.reader
            .read_message()
            .await?
            .ok_or_else(|| SyncError::Transport("server closed the connection".into()))
    }
}

/// Client side of the TCP transport
pub struct TcpClient {
    addr: String,
    timeout: Duration,
    max_frame: usize,
    pool_size: usize,
    idle: Mutex<Vec<Connection>>,
}

impl TcpClient {
    /// Client for the server at `addr` (`host:port`). Connections are opened
    /// on first use.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
            max_frame: DEFAULT_MAX_FRAME,
            pool_size: DEFAULT_POOL_SIZE,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Bound each call (including connecting) by `timeout`
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject response frames larger than `max_frame` bytes
    #[must_use]
    pub fn max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Keep at most `pool_size` idle connections
    #[must_use]
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> blocksync_core::Result<Connection> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| SyncError::Transport(format!("connect to {}: {e}", self.addr)))?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        debug!(addr = %self.addr, "connected");
        Ok(Connection {
            reader: ProtocolReader::new(read).with_max_frame(self.max_frame),
            writer: ProtocolWriter::new(write),
        })
    }

    /// Send one request and wait for its response.
    ///
    /// The connection goes back to the pool only after a complete exchange.
    /// A pooled connection may have been closed by the server since its last
    /// use; read-only requests that fail on one are sent again on a fresh
    /// connection, within the same timeout.
    async fn call(&self, request: Message) -> blocksync_core::Result<Message> {
        let pooled = self.idle.lock().pop();
        let exchange = async {
            if let Some(mut conn) = pooled {
                match conn.exchange(&request).await {
                    Ok(response) => return Ok((conn, response)),
                    Err(e) if e.is_transport() && is_read_only(&request) => {
                        debug!(request = request.name(), "stale pooled connection: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut conn = self.connect().await?;
            let response = conn.exchange(&request).await?;
            Ok::<_, SyncError>((conn, response))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok((conn, response))) => {
                let mut idle = self.idle.lock();
                if idle.len() < self.pool_size {
                    idle.push(conn);
                }
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Transport(format!(
                "{} timed out after {:?}",
                request.name(),
                self.timeout
            ))),
        }
    }
}

/// Requests that change nothing on the server and can be sent twice
fn is_read_only(request: &Message) -> bool {
    matches!(
        request,
        Message::GetFileInfoMap | Message::HasBlocks(_) | Message::GetBlock(_)
    )
}

#[async_trait]
impl RemoteStore for TcpClient {
    async fn get_file_info_map(&self) -> blocksync_core::Result<HashMap<String, FileMetadata>> {
        match self.call(Message::GetFileInfoMap).await? {
            Message::FileInfoMap(files) => Ok(files),
            other => Err(response_error(other)),
        }
    }

    async fn update_file(&self, proposed: &FileMetadata) -> blocksync_core::Result<UpdateOutcome> {
        match self.call(Message::UpdateFile(proposed.clone())).await? {
            Message::UpdateResult(outcome) => Ok(outcome),
            other => Err(response_error(other)),
        }
    }

    async fn get_block(&self, hash: &ContentHash) -> blocksync_core::Result<Block> {
        match self.call(Message::GetBlock(*hash)).await? {
            Message::Block(data) => Ok(Block::new(data)),
            other => Err(response_error(other)),
        }
    }

    async fn put_block(&self, data: Bytes) -> blocksync_core::Result<ContentHash> {
        match self.call(Message::PutBlock(data)).await? {
            Message::PutBlockOk(hash) => Ok(hash),
            other => Err(response_error(other)),
        }
    }

    async fn has_blocks(&self, hashes: &[ContentHash]) -> blocksync_core::Result<Vec<ContentHash>> {
        match self.call(Message::HasBlocks(hashes.to_vec())).await? {
            Message::BlocksPresent(present) => Ok(present),
            other => Err(response_error(other)),
        }
    }
}
