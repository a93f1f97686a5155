//! Tunnel connection management
//!
//! A relay holds at most one tunnel connection at a time. This crate provides
//! the connection handle, the shared slot that holds it, and the fixed-interval
//! reconnect state used by the dialing side.

pub mod connection;
pub mod reconnect;
pub mod slot;

pub use connection::{ConnectionError, TunnelConnection, TunnelReader};
pub use reconnect::{LinkState, LinkStatus, ReconnectConfig, ReconnectTimer};
pub use slot::TunnelSlot;
