//! Reconnection logic with a fixed retry interval
//!
//! The dialing side moves through `Disconnected -> Connecting -> Connected` and
//! falls back to `Disconnected` whenever the tunnel fails. Dial attempts are
//! only made on timer ticks, and only from `Disconnected`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::debug;
use tunerbridge_proto::DEFAULT_RECONNECT_INTERVAL_SECS;

/// Tunnel link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Time between dial attempts
    pub interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECS),
        }
    }
}

/// Shared, observable link state
#[derive(Debug, Clone)]
pub struct LinkStatus {
    tx: Arc<watch::Sender<LinkState>>,
}

impl LinkStatus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> LinkState {
        *self.tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }

    /// Move to `Connecting`, only allowed from `Disconnected`
    ///
    /// Returns `false` (and changes nothing) in any other state.
    pub fn begin_connecting(&self) -> bool {
        self.transition(|state| *state == LinkState::Disconnected, LinkState::Connecting)
    }

    /// Dial succeeded
    pub fn set_connected(&self) -> bool {
        self.transition(|state| *state == LinkState::Connecting, LinkState::Connected)
    }

    /// Dial failed or the tunnel broke
    pub fn set_disconnected(&self) -> bool {
        self.transition(|state| *state != LinkState::Disconnected, LinkState::Disconnected)
    }

    fn transition<F>(&self, allowed: F, next: LinkState) -> bool
    where
        F: Fn(&LinkState) -> bool,
    {
        self.tx.send_if_modified(|state| {
            if allowed(state) {
                debug!("Tunnel link {} -> {}", state, next);
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-interval reconnect timer
///
/// The first tick completes immediately so a relay dials as soon as it starts.
/// A slow dial delays the following ticks instead of queueing a burst.
pub struct ReconnectTimer {
    interval: Interval,
}

impl ReconnectTimer {
    pub fn new(config: &ReconnectConfig) -> Self {
        let mut interval = interval(config.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Wait for the next tick
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let status = LinkStatus::new();
        assert_eq!(status.get(), LinkState::Disconnected);
    }

    #[test]
    fn test_connect_cycle() {
        let status = LinkStatus::new();

        assert!(status.begin_connecting());
        assert_eq!(status.get(), LinkState::Connecting);

        assert!(status.set_connected());
        assert_eq!(status.get(), LinkState::Connected);

        assert!(status.set_disconnected());
        assert_eq!(status.get(), LinkState::Disconnected);
    }

    #[test]
    fn test_connecting_only_from_disconnected() {
        let status = LinkStatus::new();
        status.begin_connecting();
        status.set_connected();

        // Ticks while connected are no-ops
        assert!(!status.begin_connecting());
        assert_eq!(status.get(), LinkState::Connected);
    }

    #[test]
    fn test_failed_dial_returns_to_disconnected() {
        let status = LinkStatus::new();
        status.begin_connecting();

        assert!(status.set_disconnected());
        assert_eq!(status.get(), LinkState::Disconnected);
        assert!(!status.set_disconnected());
    }

    #[test]
    fn test_connected_requires_connecting() {
        let status = LinkStatus::new();
        assert!(!status.set_connected());
        assert_eq!(status.get(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let status = LinkStatus::new();
        let mut rx = status.subscribe();

        let observer = status.clone();
        tokio::spawn(async move {
            observer.begin_connecting();
            observer.set_connected();
        });

        rx.wait_for(|state| *state == LinkState::Connected)
            .await
            .unwrap();
        assert_eq!(status.get(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_at_fixed_interval() {
        let config = ReconnectConfig {
            interval: Duration::from_secs(3),
        };
        let mut timer = ReconnectTimer::new(&config);
        let start = tokio::time::Instant::now();

        timer.tick().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        timer.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        timer.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_dial_delays_next_tick() {
        let config = ReconnectConfig {
            interval: Duration::from_secs(3),
        };
        let mut timer = ReconnectTimer::new(&config);
        let start = tokio::time::Instant::now();

        timer.tick().await;
        // Simulate a dial that takes longer than two intervals
        tokio::time::sleep(Duration::from_secs(7)).await;

        timer.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(7));

        timer.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
