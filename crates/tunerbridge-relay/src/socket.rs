//! UDP socket helpers

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

use crate::error::RelayError;

/// Address to bind when capturing discovery broadcasts
///
/// Unix-like systems only deliver broadcasts to a socket bound to the
/// broadcast address (or the wildcard). Windows refuses to bind the broadcast
/// address, so the wildcard is used there.
pub fn default_capture_ip() -> Ipv4Addr {
    if cfg!(windows) {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::BROADCAST
    }
}

/// Create a broadcast-capable UDP socket with SO_REUSEADDR set
pub fn create_broadcast_socket(addr: SocketAddr) -> Result<std::net::UdpSocket, std::io::Error> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Bind a listening UDP socket for the relay's lifetime
pub fn bind_listener(addr: SocketAddr) -> Result<UdpSocket, RelayError> {
    create_broadcast_socket(addr)
        .and_then(UdpSocket::from_std)
        .map_err(|source| RelayError::BindError { addr, source })
}

/// Fresh socket on an OS-assigned port, allowed to send broadcasts
pub async fn ephemeral_socket() -> Result<UdpSocket, std::io::Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}
