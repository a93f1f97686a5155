//! App-side relay
//!
//! Runs on the tuner's network and poses as an application toward it. The
//! tuner-side peer connects over TCP; every envelope it sends is replayed as a
//! local broadcast from a fresh socket, and every reply that socket collects
//! within the reply window goes back through the tunnel, tagged with the
//! envelope's original origin.
//!
//! Only one tunnel connection is held at a time. A new connection replaces
//! the old one, which is left alone until its own I/O fails.

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tunerbridge_connection::{TunnelConnection, TunnelReader, TunnelSlot};
use tunerbridge_proto::{
    Envelope, DEFAULT_BUFFER_SIZE, DEFAULT_REPLY_TIMEOUT_MS, DISCOVERY_PORT, TUNNEL_PORT,
};

use crate::error::RelayError;
use crate::socket::ephemeral_socket;

/// App-side relay configuration
#[derive(Debug, Clone)]
pub struct AppRelayConfig {
    /// TCP address the tunnel is accepted on
    pub bind_addr: SocketAddr,
    /// Where queries are sent, normally the broadcast address on the discovery port
    pub query_target: SocketAddr,
    /// How long each query collects replies
    pub reply_timeout: Duration,
    pub buffer_size: usize,
    /// Ceiling on concurrently running queries (None = unbounded)
    pub max_in_flight_queries: Option<usize>,
}

impl Default for AppRelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, TUNNEL_PORT)),
            query_target: SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_in_flight_queries: None,
        }
    }
}

pub struct AppRelay {
    listener: TcpListener,
    slot: TunnelSlot,
    dispatcher: QueryDispatcher,
    buffer_size: usize,
}

impl AppRelay {
    /// Bind the tunnel listener
    pub async fn bind(config: AppRelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| RelayError::BindError {
                addr: config.bind_addr,
                source,
            })?;

        let slot = TunnelSlot::new();
        let dispatcher = QueryDispatcher {
            slot: slot.clone(),
            query_target: config.query_target,
            reply_timeout: config.reply_timeout,
            buffer_size: config.buffer_size.max(1),
            limit: config
                .max_in_flight_queries
                .map(|max| (max, Arc::new(Semaphore::new(max)))),
        };

        Ok(Self {
            listener,
            slot,
            dispatcher,
            buffer_size: config.buffer_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        info!(
            "App relay listening for tuner relay on {} (queries to {})",
            self.local_addr()?,
            self.dispatcher.query_target
        );

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
            };

            self.attach(stream, peer_addr, &shutdown);
        }

        info!("App relay stopped");
        Ok(())
    }

    /// Make a freshly accepted stream the current tunnel connection
    fn attach(&self, stream: TcpStream, peer_addr: SocketAddr, shutdown: &CancellationToken) {
        let (connection, reader) = match TunnelConnection::from_stream(stream, self.buffer_size) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Failed to set up connection from {}: {}", peer_addr, e);
                return;
            }
        };

        info!("Tuner relay connected from {}", peer_addr);

        if let Some(previous) = self.slot.replace(connection.clone()) {
            info!(
                "Connection from {} replaces {} (connection {})",
                peer_addr,
                previous.peer_addr(),
                previous.id()
            );
        }

        tokio::spawn(read_tunnel(
            connection,
            reader,
            self.dispatcher.clone(),
            shutdown.clone(),
        ));
    }
}

/// Read envelopes from one tunnel connection and start a query for each
async fn read_tunnel(
    connection: Arc<TunnelConnection>,
    mut reader: TunnelReader,
    dispatcher: QueryDispatcher,
    shutdown: CancellationToken,
) {
    loop {
        let frames = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = reader.read_frames() => match result {
                Ok(frames) => frames,
                Err(e) => {
                    info!("Tuner relay {} disconnected: {}", connection.peer_addr(), e);
                    break;
                }
            },
        };

        debug!(
            "Received {} message(s) from tuner relay {}",
            frames.len(),
            connection.peer_addr()
        );

        for frame in frames {
            dispatcher.dispatch(frame);
        }
    }

    if dispatcher.slot.clear_if(&connection) {
        debug!("Tunnel connection {} released", connection.id());
    }
}

/// Runs discovery queries on behalf of the tunnel and routes replies back
#[derive(Clone)]
struct QueryDispatcher {
    slot: TunnelSlot,
    query_target: SocketAddr,
    reply_timeout: Duration,
    buffer_size: usize,
    limit: Option<(usize, Arc<Semaphore>)>,
}

impl QueryDispatcher {
    /// Start an independent query task for one tunnel message
    fn dispatch(&self, frame: Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping invalid message from tuner relay: {}", e);
                return;
            }
        };

        let permit = match &self.limit {
            Some((max, semaphore)) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        "Dropping query from {}: {} queries already in flight",
                        envelope.origin, max
                    );
                    return;
                }
            },
            None => None,
        };

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatcher.run_query(envelope).await;
        });
    }

    /// Broadcast the query and forward every reply seen before the deadline
    async fn run_query(&self, query: Envelope) {
        let socket = match ephemeral_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Error creating query socket: {}", e);
                return;
            }
        };

        if let Err(e) = socket.send_to(&query.payload, self.query_target).await {
            warn!("Error sending query to {}: {}", self.query_target, e);
            return;
        }

        debug!(
            "Query from {} sent to {} ({} bytes)",
            query.origin,
            self.query_target,
            query.payload.len()
        );

        let deadline = Instant::now() + self.reply_timeout;
        let mut buffer = vec![0u8; self.buffer_size];
        let mut replies = 0usize;

        loop {
            match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Ok(Ok((n, device_addr))) => {
                    replies += 1;
                    debug!("Reply received from tuner {} ({} bytes)", device_addr, n);

                    let reply = Envelope::new(query.origin, Bytes::copy_from_slice(&buffer[..n]));
                    self.send_reply(reply).await;
                }
                Ok(Err(e)) => {
                    warn!("Error reading reply for {}: {}", query.origin, e);
                    break;
                }
                Err(_) => {
                    trace!(
                        "Reply window for {} closed after {} replies",
                        query.origin,
                        replies
                    );
                    break;
                }
            }
        }
    }

    /// Write a reply to whichever tunnel connection is current
    async fn send_reply(&self, reply: Envelope) {
        let frame = match reply.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping reply for {}: {}", reply.origin, e);
                return;
            }
        };

        let Some(connection) = self.slot.current() else {
            debug!("No tuner relay connected, dropping reply for {}", reply.origin);
            return;
        };

        if let Err(e) = connection.send_frame(&frame).await {
            warn!(
                "Error sending reply to tuner relay {}: {}",
                connection.peer_addr(),
                e
            );
            self.slot.clear_if(&connection);
        }
    }
}
