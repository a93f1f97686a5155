//! Relay error types

use std::net::SocketAddr;
use thiserror::Error;

/// Relay errors
///
/// Only [`RelayError::is_fatal`] errors ever leave a relay's `run` loop.
/// Everything else is logged where it happens.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to resolve host {host}: {reason}")]
    UnresolvableHost { host: String, reason: String },

    #[error("Temporary failure resolving host {host}: {reason}")]
    LookupFailed { host: String, reason: String },

    #[error("Failed to connect to {target}: {source}")]
    ConnectError {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Tunnel error: {0}")]
    ConnectionError(#[from] tunerbridge_connection::ConnectionError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RelayError {
    /// Classify a failed host lookup
    ///
    /// Resolver failures that can clear up on their own (EAI_AGAIN, timeouts)
    /// are retried. Anything else means the name does not resolve.
    pub fn from_lookup(host: &str, err: std::io::Error) -> Self {
        let host = host.to_string();
        let reason = err.to_string();

        if is_temporary_lookup_failure(&err) {
            RelayError::LookupFailed { host, reason }
        } else {
            RelayError::UnresolvableHost { host, reason }
        }
    }

    /// Errors that must stop the process rather than be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::BindError { .. } | RelayError::UnresolvableHost { .. }
        )
    }
}

fn is_temporary_lookup_failure(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
    ) {
        return true;
    }

    // getaddrinfo errors only surface as text
    let message = err.to_string().to_ascii_lowercase();
    message.contains("temporary") || message.contains("try again")
}
