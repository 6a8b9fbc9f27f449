//! [`Watchdog`] – sensor channel liveness.
//!
//! Every accepted edge on a sensor channel counts as a heartbeat.  A channel
//! is *timed out* when no heartbeat arrived within its deadline.  Time is
//! passed in explicitly so the debouncer can drive the watchdog with edge
//! timestamps.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Health state reported for a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    TimedOut,
}

struct ChannelEntry {
    last_heartbeat: Instant,
    timeout: Duration,
}

/// Tracks heartbeats per channel and reports silent ones.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sortline_kernel::watchdog::{ComponentHealth, Watchdog};
/// use tokio::time::Instant;
///
/// let start = Instant::now();
/// let mut wd = Watchdog::new();
/// wd.register(17, Duration::from_secs(5), start);
/// assert_eq!(wd.health(17, start + Duration::from_secs(1)), ComponentHealth::Healthy);
/// assert_eq!(wd.health(17, start + Duration::from_secs(6)), ComponentHealth::TimedOut);
/// ```
#[derive(Default)]
pub struct Watchdog {
    channels: BTreeMap<u8, ChannelEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` with a maximum silence of `timeout`, starting the
    /// clock at `now`.  Re-registering resets the deadline.
    pub fn register(&mut self, channel: u8, timeout: Duration, now: Instant) {
        self.channels.insert(
            channel,
            ChannelEntry {
                last_heartbeat: now,
                timeout,
            },
        );
    }

    /// Record a heartbeat.  No-op for unregistered channels.
    pub fn heartbeat(&mut self, channel: u8, at: Instant) {
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.last_heartbeat = entry.last_heartbeat.max(at);
        }
    }

    /// Restart every deadline at `now`.
    pub fn reset_all(&mut self, now: Instant) {
        for entry in self.channels.values_mut() {
            entry.last_heartbeat = now;
        }
    }

    /// Unknown channels are reported as [`ComponentHealth::TimedOut`].
    pub fn health(&self, channel: u8, now: Instant) -> ComponentHealth {
        match self.channels.get(&channel) {
            Some(entry) if now.saturating_duration_since(entry.last_heartbeat) <= entry.timeout => {
                ComponentHealth::Healthy
            }
            _ => ComponentHealth::TimedOut,
        }
    }

    /// Channels whose deadline has passed, in ascending order.
    pub fn check_all(&self, now: Instant) -> Vec<u8> {
        self.channels
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_heartbeat) > entry.timeout)
            .map(|(channel, _)| *channel)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn heartbeat_resets_deadline() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.register(17, 20 * MS, t0);
        wd.heartbeat(17, t0 + 15 * MS);
        assert_eq!(wd.health(17, t0 + 30 * MS), ComponentHealth::Healthy);
        assert_eq!(wd.health(17, t0 + 40 * MS), ComponentHealth::TimedOut);
    }

    #[test]
    fn check_all_returns_silent_channels() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.register(18, 20 * MS, t0);
        wd.register(17, 20 * MS, t0);
        wd.register(22, Duration::from_secs(60), t0);
        assert_eq!(wd.check_all(t0 + 30 * MS), vec![17, 18]);
        assert!(wd.check_all(t0 + 10 * MS).is_empty());
    }

    #[test]
    fn reset_all_restarts_deadlines() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.register(17, 20 * MS, t0);
        wd.reset_all(t0 + 100 * MS);
        assert_eq!(wd.health(17, t0 + 110 * MS), ComponentHealth::Healthy);
    }

    #[test]
    fn unknown_channel_is_timed_out_and_heartbeat_is_noop() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.heartbeat(5, t0);
        assert_eq!(wd.health(5, t0), ComponentHealth::TimedOut);
    }

    #[test]
    fn out_of_order_heartbeat_does_not_rewind() {
        let t0 = Instant::now() + Duration::from_secs(1);
        let mut wd = Watchdog::new();
        wd.register(17, 20 * MS, t0);
        wd.heartbeat(17, t0 - 500 * MS);
        assert_eq!(wd.health(17, t0 + 15 * MS), ComponentHealth::Healthy);
    }
}
