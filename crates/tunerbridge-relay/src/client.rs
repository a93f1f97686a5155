//! Client-side (tuner) relay
//!
//! Runs on the applications' network and poses as the tuner toward them.
//! Broadcast queries are captured, wrapped in an envelope carrying the
//! sender's address and pushed through the tunnel. Replies coming back are
//! unicast straight to the application named in their envelope.
//!
//! The tunnel is dialed on a fixed-interval timer. Nothing is buffered while
//! it is down: broadcasts captured without a tunnel are discarded.

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunerbridge_connection::{
    LinkStatus, ReconnectConfig, ReconnectTimer, TunnelConnection, TunnelReader, TunnelSlot,
};
use tunerbridge_proto::{Envelope, DEFAULT_BUFFER_SIZE, DISCOVERY_PORT, TUNNEL_PORT};

use crate::error::RelayError;
use crate::socket::{bind_listener, default_capture_ip};

/// Default limit on a single dial attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side relay configuration
#[derive(Debug, Clone)]
pub struct ClientRelayConfig {
    /// Where application broadcasts are captured
    pub capture_addr: SocketAddr,
    /// App-side relay host name or address
    pub remote_host: String,
    pub tunnel_port: u16,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
    pub buffer_size: usize,
}

impl ClientRelayConfig {
    pub fn new(remote_host: impl Into<String>) -> Self {
        Self {
            capture_addr: SocketAddr::from((default_capture_ip(), DISCOVERY_PORT)),
            remote_host: remote_host.into(),
            tunnel_port: TUNNEL_PORT,
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct ClientRelay {
    config: ClientRelayConfig,
    socket: Arc<UdpSocket>,
    slot: TunnelSlot,
    status: LinkStatus,
}

impl ClientRelay {
    /// Bind the capture socket
    pub async fn bind(config: ClientRelayConfig) -> Result<Self, RelayError> {
        let socket = bind_listener(config.capture_addr)?;

        Ok(Self {
            config,
            socket: Arc::new(socket),
            slot: TunnelSlot::new(),
            status: LinkStatus::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Observable tunnel state
    pub fn status(&self) -> LinkStatus {
        self.status.clone()
    }

    /// Relay until `shutdown` is cancelled or a fatal error occurs
    ///
    /// The only error returned after startup is an unresolvable tunnel host.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        info!(
            "Tuner relay listening for broadcasts on {}",
            self.local_addr()?
        );

        // Stops the capture loop and tunnel readers on shutdown or fatal error
        let stop = shutdown.child_token();

        let capture = tokio::spawn(capture_broadcasts(
            self.socket.clone(),
            self.slot.clone(),
            self.status.clone(),
            self.config.buffer_size.max(1),
            stop.clone(),
        ));

        let mut timer = ReconnectTimer::new(&self.config.reconnect);

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                _ = timer.tick() => {}
            }

            if !self.status.begin_connecting() {
                continue;
            }

            let dialed = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                dialed = self.dial() => dialed,
            };

            match dialed {
                Ok(stream) => self.attach(stream, &stop),
                Err(e) if e.is_fatal() => {
                    error!("{}", e);
                    self.status.set_disconnected();
                    break Err(e);
                }
                Err(e) => {
                    warn!("Failed to connect to app relay: {}", e);
                    self.status.set_disconnected();
                }
            }
        };

        stop.cancel();
        if let Some(connection) = self.slot.take() {
            connection.close();
        }
        self.status.set_disconnected();

        if let Err(e) = capture.await {
            warn!("Broadcast capture task failed: {}", e);
        }

        info!("Tuner relay stopped");
        result
    }

    /// Resolve the app relay host and open the tunnel
    async fn dial(&self) -> Result<TcpStream, RelayError> {
        let host = self.config.remote_host.as_str();
        let port = self.config.tunnel_port;

        info!("Connecting to app relay {}:{}", host, port);

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| RelayError::from_lookup(host, e))?
            .collect();

        if addrs.is_empty() {
            return Err(RelayError::UnresolvableHost {
                host: host.to_string(),
                reason: "no addresses found".to_string(),
            });
        }

        let target = format!("{}:{}", host, port);
        match timeout(self.config.connect_timeout, TcpStream::connect(&addrs[..])).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(RelayError::ConnectError { target, source }),
            Err(_) => Err(RelayError::ConnectTimeout(target)),
        }
    }

    /// Install a dialed stream and start reading replies from it
    fn attach(&self, stream: TcpStream, stop: &CancellationToken) {
        let (connection, reader) =
            match TunnelConnection::from_stream(stream, self.config.buffer_size) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Failed to set up tunnel connection: {}", e);
                    self.status.set_disconnected();
                    return;
                }
            };

        info!("Connected to app relay {}", connection.peer_addr());

        self.slot.replace(connection.clone());
        self.status.set_connected();

        tokio::spawn(read_replies(
            connection,
            reader,
            self.slot.clone(),
            self.status.clone(),
            stop.clone(),
        ));
    }
}

/// Tear down a failed connection and fall back to `Disconnected`
fn drop_connection(connection: &Arc<TunnelConnection>, slot: &TunnelSlot, status: &LinkStatus) {
    connection.close();
    if slot.clear_if(connection) {
        status.set_disconnected();
    }
}

/// Forward captured broadcasts into the tunnel while it is up
async fn capture_broadcasts(
    socket: Arc<UdpSocket>,
    slot: TunnelSlot,
    status: LinkStatus,
    buffer_size: usize,
    stop: CancellationToken,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let (n, app_addr) = tokio::select! {
            _ = stop.cancelled() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("Error reading UDP: {}", e);
                    continue;
                }
            },
        };

        if n == 0 {
            continue;
        }

        let Some(connection) = slot.current() else {
            debug!(
                "Discarding {} byte broadcast from {}: tunnel not connected",
                n, app_addr
            );
            continue;
        };

        let Some(origin) = ipv4_origin(app_addr) else {
            warn!("Discarding broadcast from non-IPv4 sender {}", app_addr);
            continue;
        };

        debug!("Request received from app {} ({} bytes)", origin, n);

        let envelope = Envelope::new(origin, Bytes::copy_from_slice(&buffer[..n]));
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding broadcast from {}: {}", origin, e);
                continue;
            }
        };

        if let Err(e) = connection.send_frame(&frame).await {
            warn!("Error sending to app relay: {}", e);
            drop_connection(&connection, &slot, &status);
        }
    }
}

/// Deliver every reply envelope from the tunnel to its application
async fn read_replies(
    connection: Arc<TunnelConnection>,
    mut reader: TunnelReader,
    slot: TunnelSlot,
    status: LinkStatus,
    stop: CancellationToken,
) {
    loop {
        let frames = tokio::select! {
            _ = stop.cancelled() => break,
            result = reader.read_frames() => match result {
                Ok(frames) => frames,
                Err(e) => {
                    info!("Disconnected from app relay: {}", e);
                    break;
                }
            },
        };

        for frame in frames {
            let envelope = match Envelope::decode(frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Dropping invalid message from app relay: {}", e);
                    continue;
                }
            };

            debug!(
                "Replying to app {} ({} bytes)",
                envelope.origin,
                envelope.payload.len()
            );

            if let Err(e) = send_unicast(envelope.origin, &envelope.payload).await {
                warn!("Error sending reply to {}: {}", envelope.origin, e);
            }
        }
    }

    drop_connection(&connection, &slot, &status);
}

/// Send one datagram from a fresh socket
async fn send_unicast(dest: SocketAddrV4, payload: &[u8]) -> Result<(), std::io::Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.send_to(payload, dest).await?;
    Ok(())
}

/// Envelope origin for a sender, if it can be expressed as IPv4
fn ipv4_origin(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}
