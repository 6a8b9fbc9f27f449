//! Telemetry sinks.
//!
//! A [`TelemetrySink`] accepts snapshots synchronously and must never block:
//! when the consumer is slow or absent the snapshot is refused with a
//! [`SinkError`] and the publisher counts it as dropped.

use sortline_types::{EventPayload, TelemetrySnapshot};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::bus::{EventBus, Topic};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink buffer is full")]
    Full,
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for periodic telemetry snapshots.
pub trait TelemetrySink: Send + Sync {
    /// Hand `snapshot` to the consumer without waiting.
    fn try_deliver(&self, snapshot: &TelemetrySnapshot) -> Result<(), SinkError>;
}

/// Publishes snapshots on [`Topic::Telemetry`] of the [`EventBus`].
///
/// Broadcast semantics bound memory: lagging dashboard subscribers lose the
/// oldest snapshots.
pub struct BusSink {
    bus: EventBus,
}

impl BusSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl TelemetrySink for BusSink {
    fn try_deliver(&self, snapshot: &TelemetrySnapshot) -> Result<(), SinkError> {
        match self.bus.emit(
            Topic::Telemetry,
            "sortline-runtime::telemetry",
            EventPayload::Telemetry(snapshot.clone()),
        ) {
            0 => Err(SinkError::Unavailable("no telemetry subscribers".to_string())),
            _ => Ok(()),
        }
    }
}

/// Forwards snapshots into a bounded mpsc channel.
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetrySnapshot>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetrySnapshot>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn try_deliver(&self, snapshot: &TelemetrySnapshot) -> Result<(), SinkError> {
        self.tx.try_send(snapshot.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => {
                SinkError::Unavailable("receiver dropped".to_string())
            }
        })
    }
}

/// Writes each snapshot as a single JSON `tracing` event.
#[derive(Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn try_deliver(&self, snapshot: &TelemetrySnapshot) -> Result<(), SinkError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| SinkError::Unavailable(format!("serialization failed: {e}")))?;
        info!(target: "sortline::telemetry", snapshot = %json, "telemetry");
        Ok(())
    }
}
