//! HDHomeRun discovery relays
//!
//! Two roles bridge UDP broadcast discovery across a network boundary:
//!
//! - [`AppRelay`] runs next to the tuner. It accepts the tunnel, replays each
//!   query as a local broadcast and sends every reply back through the tunnel.
//! - [`ClientRelay`] runs next to the applications. It captures their
//!   broadcasts, keeps the tunnel dialed, and unicasts replies to whichever
//!   application asked.
//!
//! Either side can instead run a [`DirectRelay`], a single-hop UDP splice to a
//! known device address with no tunnel involved.

pub mod app;
pub mod client;
pub mod direct;
pub mod error;
pub mod socket;

pub use app::{AppRelay, AppRelayConfig};
pub use client::{ClientRelay, ClientRelayConfig};
pub use direct::{DirectRelay, DirectRelayConfig};
pub use error::RelayError;
pub use socket::default_capture_ip;

pub use tunerbridge_connection::{LinkState, LinkStatus, ReconnectConfig};
