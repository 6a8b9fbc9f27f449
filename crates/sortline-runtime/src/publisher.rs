//! [`TelemetryPublisher`] – periodic snapshots of the whole line.
//!
//! Reads only published state (actuator watch channels, the latch, the
//! dispatch counters) and never touches a driver, so a slow or missing
//! consumer cannot stall actuation.  Snapshots the sink refuses are counted
//! and the count travels in the next snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use sortline_kernel::SafetyLatch;
use sortline_middleware::{SinkError, TelemetrySink};
use sortline_types::{ActuatorState, ActuatorTelemetry, SCHEMA_VERSION, TelemetrySnapshot};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::scheduler::DispatchStats;

#[derive(Clone)]
pub struct TelemetryPublisher {
    actuators: Vec<watch::Receiver<ActuatorState>>,
    latch: SafetyLatch,
    stats: Arc<DispatchStats>,
    sink: Arc<dyn TelemetrySink>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryPublisher {
    pub fn new(
        actuators: Vec<watch::Receiver<ActuatorState>>,
        latch: SafetyLatch,
        stats: Arc<DispatchStats>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            actuators,
            latch,
            stats,
            sink,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Assemble a snapshot of the current state.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            schema_version: SCHEMA_VERSION,
            taken_at: Utc::now(),
            actuators: self
                .actuators
                .iter()
                .map(|rx| ActuatorTelemetry::from(&*rx.borrow()))
                .collect(),
            safety: self.latch.state(),
            dispatch: self.stats.snapshot(),
            dropped_snapshots: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Build one snapshot and offer it to the sink.
    pub fn publish_once(&self) -> Result<(), SinkError> {
        let snapshot = self.snapshot();
        self.sink.try_deliver(&snapshot).inspect_err(|error| {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(%error, dropped, "telemetry snapshot dropped");
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Publish every `period` until `shutdown` flips to `true`.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "telemetry publisher started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let _ = self.publish_once();
                }
            }
        }
        info!(dropped = self.dropped(), "telemetry publisher stopped");
    }
}
