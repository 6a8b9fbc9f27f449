//! Error types shared across the workspace.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::DriveMode;

/// Invalid actuator table or configuration file.  Always fatal at startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("actuator table is empty")]
    EmptyTable,

    #[error("actuator id must not be empty")]
    EmptyActuatorId,

    #[error("actuator '{0}' is defined more than once")]
    DuplicateActuator(String),

    #[error("{actuator}: field {field} is not a finite number")]
    NotFinite { actuator: String, field: &'static str },

    #[error("{actuator}: safe range [{min}, {max}] is empty or inverted")]
    InvalidRange { actuator: String, min: f32, max: f32 },

    #[error("{actuator}: {field} = {value} lies outside safe range [{min}, {max}]")]
    PositionOutOfRange {
        actuator: String,
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("{actuator}: relative offset {offset} must be non-zero and within range width {width}")]
    InvalidOffset {
        actuator: String,
        offset: f32,
        width: f32,
    },

    #[error("{actuator}: activation duration must be positive")]
    ZeroDuration { actuator: String },

    #[error("{actuator}: {driver} driver does not support {mode:?} drive mode")]
    UnsupportedDriveMode {
        actuator: String,
        driver: &'static str,
        mode: DriveMode,
    },

    #[error("{actuator}: {details}")]
    InvalidDriver { actuator: String, details: String },

    #[error("channel {channel} is assigned to both '{first}' and '{second}'")]
    DuplicateChannel {
        channel: u8,
        first: String,
        second: String,
    },

    #[error("category '{category}' is assigned to both '{first}' and '{second}'")]
    DuplicateCategory {
        category: String,
        first: String,
        second: String,
    },

    #[error("default actuator '{0}' is not defined")]
    UnknownDefaultActuator(String),

    #[error("sensor channel {0} is configured more than once")]
    DuplicateSensor(u8),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("failed to access configuration file: {0}")]
    Io(String),
}

/// Failure reported by an actuator driver or its output channel.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverError {
    /// The commanded transition was not confirmed by feedback, or feedback
    /// disagreed with the command beyond tolerance.
    #[error("no confirmation: expected {expected}, observed {observed:?}")]
    NoConfirmation { expected: f32, observed: Option<f32> },

    /// The output capability (GPIO/PWM daemon) could not be reached.
    #[error("output channel unavailable: {0}")]
    Unavailable(String),

    /// The driver refused the command without touching the hardware.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Workspace-wide error type.
#[derive(Error, Debug)]
pub enum SorterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown actuator '{0}'")]
    UnknownActuator(String),

    #[error("driver fault on {actuator}: {source}")]
    Driver {
        actuator: String,
        #[source]
        source: DriverError,
    },

    #[error("safety interlock: {0}")]
    Safety(String),

    #[error("channel closed: {0}")]
    Channel(String),
}
