//! Tunnel Protocol Definitions
//!
//! This crate defines the wire format spoken between the two relay roles:
//! length-prefixed frames on the tunnel byte stream, and the envelope that
//! carries a discovery datagram together with the address it came from.

pub mod codec;
pub mod envelope;

pub use codec::{CodecError, MessageCodec};
pub use envelope::{Envelope, EnvelopeError};

/// Well-known UDP port used by HDHomeRun discovery
pub const DISCOVERY_PORT: u16 = 65001;

/// Default tunnel listening port (same number as discovery, but TCP)
pub const TUNNEL_PORT: u16 = DISCOVERY_PORT;

/// Default window for collecting discovery replies, in milliseconds
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 500;

/// Default size of UDP and tunnel read buffers
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default interval between tunnel dial attempts, in seconds
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 3;
