//! [`SensorDebouncer`] – raw sensor edges in, at most one trigger per pass
//! out.
//!
//! Each channel walks `Idle → Armed → Cooldown → Idle`.  An edge to the
//! active level while `Idle` arms the channel and emits a sensor
//! [`TriggerEvent`].  Every further edge inside the cooldown window (measured
//! from the arming edge) is contact bounce or the trailing edge of the same
//! item and is dropped without a trace above `trace` level.

use std::collections::BTreeMap;
use std::time::Duration;

use sortline_types::{ConfigError, RawEdge, TriggerEvent};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::watchdog::Watchdog;

/// Static configuration of one sensor input.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub channel: u8,
    /// Logic level that means "item present".
    pub active_level: bool,
    pub cooldown: Duration,
    /// Maximum silence while the belt is running.
    pub watchdog: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncePhase {
    Idle,
    /// An item was detected at `since`; no further edge has arrived yet.
    Armed { since: Instant },
    /// Suppressing edges until `until`.
    Cooldown { until: Instant },
}

struct ChannelEntry {
    config: SensorConfig,
    phase: DebouncePhase,
    degraded: bool,
}

impl ChannelEntry {
    /// Phase after letting time advance to `now`.
    fn phase_at(&self, now: Instant) -> DebouncePhase {
        match self.phase {
            DebouncePhase::Armed { since } if now >= since + self.config.cooldown => {
                DebouncePhase::Idle
            }
            DebouncePhase::Cooldown { until } if now >= until => DebouncePhase::Idle,
            phase => phase,
        }
    }
}

pub struct SensorDebouncer {
    channels: BTreeMap<u8, ChannelEntry>,
    watchdog: Watchdog,
    belt_running: bool,
}

impl SensorDebouncer {
    /// # Errors
    ///
    /// [`ConfigError::DuplicateSensor`] when a channel is listed twice.
    pub fn new(sensors: Vec<SensorConfig>, now: Instant) -> Result<Self, ConfigError> {
        let mut channels = BTreeMap::new();
        let mut watchdog = Watchdog::new();
        for config in sensors {
            let channel = config.channel;
            watchdog.register(channel, config.watchdog, now);
            let entry = ChannelEntry {
                config,
                phase: DebouncePhase::Idle,
                degraded: false,
            };
            if channels.insert(channel, entry).is_some() {
                return Err(ConfigError::DuplicateSensor(channel));
            }
        }
        Ok(Self {
            channels,
            watchdog,
            belt_running: false,
        })
    }

    /// Feed one raw edge.  Returns the trigger to forward, if any.
    pub fn on_edge(&mut self, edge: RawEdge) -> Option<TriggerEvent> {
        let Some(entry) = self.channels.get_mut(&edge.channel) else {
            trace!(channel = edge.channel, "edge on unconfigured sensor channel");
            return None;
        };
        self.watchdog.heartbeat(edge.channel, edge.timestamp);

        match entry.phase_at(edge.timestamp) {
            DebouncePhase::Idle if edge.level == entry.config.active_level => {
                entry.phase = DebouncePhase::Armed {
                    since: edge.timestamp,
                };
                Some(TriggerEvent::sensor(edge.timestamp))
            }
            DebouncePhase::Idle => {
                entry.phase = DebouncePhase::Idle;
                None
            }
            DebouncePhase::Armed { since } => {
                trace!(channel = edge.channel, "edge suppressed (armed)");
                entry.phase = DebouncePhase::Cooldown {
                    until: since + entry.config.cooldown,
                };
                None
            }
            DebouncePhase::Cooldown { .. } => {
                trace!(channel = edge.channel, "edge suppressed (cooldown)");
                None
            }
        }
    }

    pub fn phase(&self, channel: u8, now: Instant) -> Option<DebouncePhase> {
        self.channels.get(&channel).map(|entry| entry.phase_at(now))
    }

    /// Tell the debouncer whether the conveyor is moving.  Silence is only
    /// a fault while it is; starting the belt restarts every deadline.
    pub fn set_belt_running(&mut self, running: bool, now: Instant) {
        if running && !self.belt_running {
            self.watchdog.reset_all(now);
        }
        self.belt_running = running;
    }

    pub fn belt_running(&self) -> bool {
        self.belt_running
    }

    /// Flag channels that have been silent past their watchdog period.
    ///
    /// Returns only channels that became degraded on this call.
    pub fn check_watchdog(&mut self, now: Instant) -> Vec<u8> {
        if !self.belt_running {
            return Vec::new();
        }
        let mut newly_degraded = Vec::new();
        for channel in self.watchdog.check_all(now) {
            if let Some(entry) = self.channels.get_mut(&channel)
                && !entry.degraded
            {
                warn!(channel, "sensor channel silent while belt running; marking degraded");
                entry.degraded = true;
                newly_degraded.push(channel);
            }
        }
        newly_degraded
    }

    pub fn is_degraded(&self, channel: u8) -> bool {
        self.channels.get(&channel).is_some_and(|entry| entry.degraded)
    }

    /// Clear the degraded flag and restart the channel's watchdog at `now`.
    ///
    /// Returns `false` for an unknown channel.
    pub fn clear_degraded(&mut self, channel: u8, now: Instant) -> bool {
        match self.channels.get_mut(&channel) {
            Some(entry) => {
                entry.degraded = false;
                self.watchdog.register(channel, entry.config.watchdog, now);
                true
            }
            None => false,
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels.keys().copied()
    }
}
