//! Single-connection slot shared by the accept/dial loop, the reader and writers
//!
//! The lock only guards the `Option<Arc<..>>` itself. Callers clone the handle
//! out and do their I/O after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::connection::TunnelConnection;

type Slot = Option<Arc<TunnelConnection>>;

/// Holds the relay's current tunnel connection, if any
#[derive(Clone, Default)]
pub struct TunnelSlot {
    inner: Arc<Mutex<Slot>>,
}

impl TunnelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection, if one is held
    pub fn current(&self) -> Option<Arc<TunnelConnection>> {
        self.lock().clone()
    }

    /// Install a new connection, returning the one it displaced
    ///
    /// The displaced connection is not closed.
    pub fn replace(&self, connection: Arc<TunnelConnection>) -> Option<Arc<TunnelConnection>> {
        let previous = self.lock().replace(connection);
        if let Some(ref old) = previous {
            debug!("Tunnel connection {} replaced", old.id());
        }
        previous
    }

    /// Clear the slot only if it still holds `connection`
    ///
    /// Returns `true` if the slot was cleared.
    pub fn clear_if(&self, connection: &Arc<TunnelConnection>) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, connection) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Remove and return whatever connection is held
    pub fn take(&self) -> Option<Arc<TunnelConnection>> {
        self.lock().take()
    }
}

impl std::fmt::Debug for TunnelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSlot")
            .field("connection", &self.current())
            .finish()
    }
}
