//! `sortline-types` – shared data model for the actuation core.
//!
//! - [`profile`] – immutable [`ActuatorProfile`]s and the validated
//!   [`ActuatorTable`].
//! - [`trigger`] – raw sensor edges, [`TriggerEvent`]s and classification
//!   messages.
//! - [`state`] – [`ActuatorState`], [`SafetyState`], [`ActivationRequest`]
//!   and admission [`RejectReason`]s.
//! - [`telemetry`] – the versioned [`TelemetrySnapshot`] wire format.
//! - [`error`] – [`ConfigError`], [`DriverError`], [`SorterError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod profile;
pub mod state;
pub mod telemetry;
pub mod trigger;

pub use error::{ConfigError, DriverError, SorterError};
pub use profile::{
    ActuatorProfile, ActuatorTable, DriveMode, DriverSettings, PositionRange, ServoSettings,
    StepperSettings,
};
pub use state::{ActivationRequest, ActuatorState, Admission, RejectReason, SafetyState};
pub use telemetry::{ActuatorTelemetry, DispatchCounters, SCHEMA_VERSION, TelemetrySnapshot};
pub use trigger::{ClassificationMessage, RawEdge, TriggerEvent, TriggerSource};

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "sortline-runtime::scheduler"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Telemetry(TelemetrySnapshot),
    Activation {
        actuator_id: String,
        target_position: f32,
        source: TriggerSource,
    },
    Rejection {
        actuator_id: Option<String>,
        reason: RejectReason,
    },
    Safety(SafetyState),
    Diagnostic(Diagnostic),
}

/// Non-fatal condition worth surfacing to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub component: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A sensor channel stopped reporting while the belt was running.
    SensorSilent,
    /// A driver failed to confirm a command; the actuator is now degraded.
    DriverFault,
    /// The safety monitor latched an emergency stop.
    SafetyTrip,
    /// The trigger queue was full and an event was dropped.
    TriggerQueueFull,
}
