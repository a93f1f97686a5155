//! TCP tunnel connection
//!
//! The stream is split: the write half lives in a shared [`TunnelConnection`]
//! that any task may write frames through, the read half goes to a single
//! [`TunnelReader`] that owns the connection's frame decoder.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tunerbridge_proto::MessageCodec;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Tunnel connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ClosedByPeer,

    #[error("Connection closed")]
    Closed,
}

/// Write side of a tunnel connection, shared between tasks
pub struct TunnelConnection {
    id: u64,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl TunnelConnection {
    /// Split an established stream into the shared writer and its reader
    pub fn from_stream(
        stream: TcpStream,
        read_buffer_size: usize,
    ) -> Result<(Arc<Self>, TunnelReader), ConnectionError> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let closed = CancellationToken::new();

        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            writer: Mutex::new(write_half),
            closed: closed.clone(),
        });

        let reader = TunnelReader {
            connection_id: connection.id,
            read_half,
            codec: MessageCodec::new(),
            buffer: vec![0u8; read_buffer_size.max(1)],
            closed,
        };

        debug!("Tunnel connection {} established with {}", connection.id, peer_addr);

        Ok((connection, reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write one encoded frame
    ///
    /// Concurrent callers are serialized so frames never interleave on the wire.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        trace!("Wrote {} bytes to tunnel connection {}", frame.len(), self.id);

        Ok(())
    }

    /// Stop the reader and refuse further writes
    ///
    /// The socket itself is released once the last handle is dropped.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("Closing tunnel connection {} ({})", self.id, self.peer_addr);
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Read side of a tunnel connection, with its private frame decoder
pub struct TunnelReader {
    connection_id: u64,
    read_half: OwnedReadHalf,
    codec: MessageCodec,
    buffer: Vec<u8>,
    closed: CancellationToken,
}

impl TunnelReader {
    /// Wait for the next read that completes at least one frame
    ///
    /// Frames are returned in stream order. Any error ends the connection;
    /// the caller is expected to drop the reader afterwards.
    pub async fn read_frames(&mut self) -> Result<Vec<Bytes>, ConnectionError> {
        loop {
            let n = tokio::select! {
                _ = self.closed.cancelled() => return Err(ConnectionError::Closed),
                result = self.read_half.read(&mut self.buffer) => result?,
            };

            if n == 0 {
                if !self.codec.is_idle() {
                    debug!(
                        "Tunnel connection {} closed in the middle of a frame",
                        self.connection_id
                    );
                }
                return Err(ConnectionError::ClosedByPeer);
            }

            trace!("Read {} bytes from tunnel connection {}", n, self.connection_id);

            let mut frames = Vec::new();
            self.codec.decode(&self.buffer[..n], |frame| frames.push(frame));

            if !frames.is_empty() {
                return Ok(frames);
            }
        }
    }
}
