//! Direct (passthrough) relay
//!
//! Listens for discovery broadcasts and forwards each one as a unicast to a
//! single known device, relaying the device's reply back to the sender through
//! the listening socket. No tunnel is involved, and the relay behaves the same
//! whichever side of the network it runs on.

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunerbridge_proto::{DEFAULT_BUFFER_SIZE, DEFAULT_REPLY_TIMEOUT_MS, DISCOVERY_PORT};

use crate::error::RelayError;
use crate::socket::bind_listener;

/// Direct relay configuration
#[derive(Debug, Clone)]
pub struct DirectRelayConfig {
    /// Where discovery broadcasts are received
    pub listen_addr: SocketAddr,
    /// Device every query is forwarded to
    pub device_addr: SocketAddr,
    /// How long to wait for the device to answer
    pub reply_timeout: Duration,
    pub buffer_size: usize,
}

impl DirectRelayConfig {
    pub fn new(listen_addr: SocketAddr, device_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            device_addr,
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for DirectRelayConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, DISCOVERY_PORT)),
        )
    }
}

pub struct DirectRelay {
    config: DirectRelayConfig,
    socket: Arc<UdpSocket>,
}

impl DirectRelay {
    /// Bind the listening socket
    pub async fn bind(config: DirectRelayConfig) -> Result<Self, RelayError> {
        let socket = bind_listener(config.listen_addr)?;

        Ok(Self {
            config,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Forward queries until `shutdown` is cancelled
    ///
    /// Queries already forwarded are left to finish within the reply timeout.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        info!(
            "Direct relay listening for broadcasts on {}, forwarding to {}",
            self.local_addr()?,
            self.config.device_addr
        );

        let mut buffer = vec![0u8; self.config.buffer_size.max(1)];

        loop {
            let (n, app_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buffer) => match result {
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

            debug!("Request received from app {} ({} bytes)", app_addr, n);

            let query = Bytes::copy_from_slice(&buffer[..n]);
            let listener = self.socket.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = forward_query(&config, &listener, query, app_addr).await {
                    error!(
                        "Error forwarding query from {} to device {}: {}",
                        app_addr, config.device_addr, e
                    );
                }
            });
        }

        info!("Direct relay stopped");
        Ok(())
    }
}

/// Send one query to the device and relay at most one reply back to the app
async fn forward_query(
    config: &DirectRelayConfig,
    listener: &UdpSocket,
    query: Bytes,
    app_addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let bind_addr: SocketAddr = if config.device_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let upstream = UdpSocket::bind(bind_addr).await?;
    upstream.connect(config.device_addr).await?;
    upstream.send(&query).await?;

    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let n = match timeout(config.reply_timeout, upstream.recv(&mut buffer)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!(
                "No reply from device {} within {:?}",
                config.device_addr, config.reply_timeout
            );
            return Ok(());
        }
    };

    if n == 0 {
        return Ok(());
    }

    debug!(
        "Response received from device {} ({} bytes), relaying to {}",
        config.device_addr, n, app_addr
    );
    listener.send_to(&buffer[..n], app_addr).await?;

    Ok(())
}
