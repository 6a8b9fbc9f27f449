//! Trigger inputs: raw sensor edges, debounced trigger events and
//! classification results from the vision collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Where a [`TriggerEvent`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Sensor,
    Classification,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Sensor => write!(f, "sensor"),
            TriggerSource::Classification => write!(f, "classification"),
        }
    }
}

/// A discrete request for action.  Consumed exactly once by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    pub timestamp: Instant,
    pub category: Option<String>,
    pub confidence: Option<f32>,
}

impl TriggerEvent {
    /// A categoryless pulse from a photoelectric/proximity sensor.
    pub fn sensor(timestamp: Instant) -> Self {
        Self {
            source: TriggerSource::Sensor,
            timestamp,
            category: None,
            confidence: None,
        }
    }

    /// A classification result for `category`.
    pub fn classification(category: impl Into<String>, confidence: f32, timestamp: Instant) -> Self {
        Self {
            source: TriggerSource::Classification,
            timestamp,
            category: Some(category.into()),
            confidence: Some(confidence),
        }
    }
}

/// A timestamped logic-level transition on a sensor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEdge {
    pub channel: u8,
    /// Logic level after the transition.
    pub level: bool,
    pub timestamp: Instant,
}

/// Wire format of a classification result pushed by the inference service.
///
/// Confidence thresholding is the producer's job; the core accepts every
/// message as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMessage {
    pub category: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationMessage {
    /// Convert into a [`TriggerEvent`] stamped with the local arrival time.
    pub fn into_trigger(self, arrived_at: Instant) -> TriggerEvent {
        TriggerEvent::classification(self.category, self.confidence, arrived_at)
    }
}
