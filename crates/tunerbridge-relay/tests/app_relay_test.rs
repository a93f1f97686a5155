//! App-side relay tests against loopback sockets
//!
//! A UDP socket on 127.0.0.1 stands in for the tuner, and the test itself
//! plays the tuner-side relay over TCP.

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tunerbridge_proto::{Envelope, MessageCodec};
use tunerbridge_relay::{AppRelay, AppRelayConfig};

const REPLY_TIMEOUT: Duration = Duration::from_millis(300);

struct Harness {
    relay_addr: SocketAddr,
    device: UdpSocket,
    shutdown: CancellationToken,
}

async fn start_relay(max_in_flight_queries: Option<usize>) -> Harness {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let config = AppRelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        query_target: device.local_addr().unwrap(),
        reply_timeout: REPLY_TIMEOUT,
        buffer_size: 4096,
        max_in_flight_queries,
    };

    let relay = AppRelay::bind(config).await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(relay.run(shutdown.clone()));

    Harness {
        relay_addr,
        device,
        shutdown,
    }
}

/// Tuner-side end of the tunnel
struct TunnelPeer {
    stream: TcpStream,
    codec: MessageCodec,
    pending: Vec<Envelope>,
}

impl TunnelPeer {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            codec: MessageCodec::new(),
            pending: Vec::new(),
        }
    }

    async fn send(&mut self, envelope: &Envelope) {
        let frame = envelope.to_frame().unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_raw_frame(&mut self, payload: &[u8]) {
        let frame = MessageCodec::encode(payload).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Next reply envelope, or None if nothing arrives within `wait`
    async fn recv(&mut self, wait: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = [0u8; 4096];

        while self.pending.is_empty() {
            let n = match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(result) => result.unwrap(),
                Err(_) => return None,
            };
            assert!(n > 0, "relay closed the tunnel");

            let pending = &mut self.pending;
            self.codec.decode(&buf[..n], |frame| {
                pending.push(Envelope::decode(frame).unwrap());
            });
        }

        Some(self.pending.remove(0))
    }
}

fn origin() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 42), 54321)
}

async fn device_recv(device: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 4096];
    let (n, from) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
        .await
        .expect("query never reached the device")
        .unwrap();
    (buf[..n].to_vec(), from)
}

#[tokio::test]
async fn test_reply_is_wrapped_with_original_origin() {
    let harness = start_relay(None).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    peer.send(&Envelope::new(origin(), Bytes::from_static(b"QUERY")))
        .await;

    let (query, query_socket) = device_recv(&harness.device).await;
    assert_eq!(query, b"QUERY");

    harness
        .device
        .send_to(b"ANSWER", query_socket)
        .await
        .unwrap();

    let reply = peer.recv(Duration::from_secs(2)).await.expect("no reply");
    assert_eq!(reply, Envelope::new(origin(), Bytes::from_static(b"ANSWER")));

    // Exactly one reply for one answer
    assert!(peer.recv(REPLY_TIMEOUT * 2).await.is_none());

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_no_reply_when_device_is_silent() {
    let harness = start_relay(None).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    peer.send(&Envelope::new(origin(), Bytes::from_static(b"QUERY")))
        .await;

    let (query, _) = device_recv(&harness.device).await;
    assert_eq!(query, b"QUERY");

    assert!(peer.recv(REPLY_TIMEOUT * 3).await.is_none());

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_every_reply_within_window_is_forwarded() {
    let harness = start_relay(None).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    peer.send(&Envelope::new(origin(), Bytes::from_static(b"QUERY")))
        .await;

    let (_, query_socket) = device_recv(&harness.device).await;

    // A second tuner answering the same broadcast
    let second_device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    harness
        .device
        .send_to(b"TUNER-1", query_socket)
        .await
        .unwrap();
    second_device
        .send_to(b"TUNER-2", query_socket)
        .await
        .unwrap();

    let mut payloads = vec![
        peer.recv(Duration::from_secs(2)).await.unwrap().payload,
        peer.recv(Duration::from_secs(2)).await.unwrap().payload,
    ];
    payloads.sort();

    assert_eq!(
        payloads,
        vec![Bytes::from_static(b"TUNER-1"), Bytes::from_static(b"TUNER-2")]
    );

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_late_reply_is_dropped() {
    let harness = start_relay(None).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    peer.send(&Envelope::new(origin(), Bytes::from_static(b"QUERY")))
        .await;

    let (_, query_socket) = device_recv(&harness.device).await;
    tokio::time::sleep(REPLY_TIMEOUT * 2).await;

    // The query socket is closed by now, so this goes nowhere
    let _ = harness.device.send_to(b"TOO LATE", query_socket).await;

    assert!(peer.recv(REPLY_TIMEOUT * 2).await.is_none());

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_short_envelope_is_dropped() {
    let harness = start_relay(None).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    peer.send_raw_frame(b"\x01\x02\x03").await;
    peer.send(&Envelope::new(origin(), Bytes::from_static(b"VALID")))
        .await;

    // Only the valid envelope turns into a query, and the tunnel stays up
    let (query, query_socket) = device_recv(&harness.device).await;
    assert_eq!(query, b"VALID");

    harness.device.send_to(b"OK", query_socket).await.unwrap();
    let reply = peer.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.payload, Bytes::from_static(b"OK"));

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_newest_connection_receives_replies() {
    let harness = start_relay(None).await;
    let mut first = TunnelPeer::connect(harness.relay_addr).await;
    let mut second = TunnelPeer::connect(harness.relay_addr).await;

    // Let the relay accept both before the query goes out
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The replaced connection can still send queries
    first
        .send(&Envelope::new(origin(), Bytes::from_static(b"QUERY")))
        .await;

    let (_, query_socket) = device_recv(&harness.device).await;
    harness
        .device
        .send_to(b"ANSWER", query_socket)
        .await
        .unwrap();

    let reply = second.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, Envelope::new(origin(), Bytes::from_static(b"ANSWER")));
    assert!(first.recv(REPLY_TIMEOUT).await.is_none());

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_queries_keep_their_origins() {
    let harness = start_relay(None).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    let origin_a = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1111);
    let origin_b = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 2222);

    peer.send(&Envelope::new(origin_a, Bytes::from_static(b"A")))
        .await;
    peer.send(&Envelope::new(origin_b, Bytes::from_static(b"B")))
        .await;

    for _ in 0..2 {
        let (query, query_socket) = device_recv(&harness.device).await;
        let answer = [b"ANSWER-".as_slice(), query.as_slice()].concat();
        harness.device.send_to(&answer, query_socket).await.unwrap();
    }

    let mut replies = vec![
        peer.recv(Duration::from_secs(2)).await.unwrap(),
        peer.recv(Duration::from_secs(2)).await.unwrap(),
    ];
    replies.sort_by_key(|reply| reply.origin.port());

    assert_eq!(
        replies,
        vec![
            Envelope::new(origin_a, Bytes::from_static(b"ANSWER-A")),
            Envelope::new(origin_b, Bytes::from_static(b"ANSWER-B")),
        ]
    );

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_query_ceiling_drops_excess() {
    let harness = start_relay(Some(1)).await;
    let mut peer = TunnelPeer::connect(harness.relay_addr).await;

    peer.send(&Envelope::new(origin(), Bytes::from_static(b"FIRST")))
        .await;
    let (query, _) = device_recv(&harness.device).await;
    assert_eq!(query, b"FIRST");

    // First query is still collecting replies
    peer.send(&Envelope::new(origin(), Bytes::from_static(b"SECOND")))
        .await;

    let mut buf = [0u8; 64];
    let extra = timeout(REPLY_TIMEOUT / 2, harness.device.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "query over the ceiling was sent");

    // Once the first window closes, new queries go through again
    tokio::time::sleep(REPLY_TIMEOUT).await;
    peer.send(&Envelope::new(origin(), Bytes::from_static(b"THIRD")))
        .await;
    let (query, _) = device_recv(&harness.device).await;
    assert_eq!(query, b"THIRD");

    harness.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_stops_relay() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = AppRelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        query_target: device.local_addr().unwrap(),
        ..AppRelayConfig::default()
    };

    let relay = AppRelay::bind(config).await.unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(relay.run(shutdown.clone()));

    shutdown.cancel();

    let result = timeout(Duration::from_secs(1), handle)
        .await
        .expect("relay did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = AppRelayConfig {
        bind_addr: taken.local_addr().unwrap(),
        ..AppRelayConfig::default()
    };

    let err = AppRelay::bind(config).await.err().expect("bind should fail");
    assert!(err.is_fatal());
}
