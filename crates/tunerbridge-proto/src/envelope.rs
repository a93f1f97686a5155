//! Envelope carried inside tunnel frames
//!
//! Layout: `[origin ip: 4][origin port: u16 big-endian][discovery datagram]`
//!
//! The origin is the application that sent the original broadcast. Replies
//! travel back in an envelope carrying the same origin, which is all the
//! client side needs to route them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

use crate::codec::{CodecError, MessageCodec};

/// Envelope header size: ip (4) + port (2)
pub const ENVELOPE_HEADER_LEN: usize = 6;

/// Envelope errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope too short: {0} bytes")]
    TooShort(usize),
}

/// Discovery datagram tagged with the address of the application it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub origin: SocketAddrV4,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(origin: SocketAddrV4, payload: impl Into<Bytes>) -> Self {
        Self {
            origin,
            payload: payload.into(),
        }
    }

    /// Serialize to the envelope layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        buf.put_slice(&self.origin.ip().octets());
        buf.put_u16(self.origin.port());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse an envelope from a decoded frame
    pub fn decode(mut buf: Bytes) -> Result<Self, EnvelopeError> {
        if buf.len() < ENVELOPE_HEADER_LEN {
            return Err(EnvelopeError::TooShort(buf.len()));
        }

        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();

        Ok(Self {
            origin: SocketAddrV4::new(ip, port),
            payload: buf,
        })
    }

    /// Serialize and wrap in a tunnel frame
    pub fn to_frame(&self) -> Result<Bytes, CodecError> {
        MessageCodec::encode(&self.encode())
    }
}
