//! Static actuator configuration.
//!
//! An [`ActuatorProfile`] is built once at startup from configuration and is
//! never mutated afterwards.  Profiles are collected into an
//! [`ActuatorTable`], which validates every entry (and the cross-entry
//! constraints such as unique channels and categories) before the process is
//! allowed to start.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How an actuator interprets its `activation_position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    /// `activation_position` is an absolute position (diverter angle).
    #[default]
    Absolute,
    /// `activation_position` is an offset from the current position
    /// (labeling-head feed distance).
    Relative,
}

/// Inclusive `[min, max]` range of positions an actuator may be commanded to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionRange {
    pub min: f32,
    pub max: f32,
}

impl PositionRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// `true` when `position` lies inside the range (bounds inclusive).
    pub fn contains(&self, position: f32) -> bool {
        position >= self.min && position <= self.max
    }

    /// Clamp `position` into the range.
    pub fn clamp(&self, position: f32) -> f32 {
        position.clamp(self.min, self.max)
    }

    pub fn width(&self) -> f32 {
        self.max - self.min
    }
}

/// Pulse-width calibration for a hobby servo (SG995 / MG995 class).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoSettings {
    /// Pulse width commanding 0 degrees.
    #[serde(default = "default_min_pulse_us")]
    pub min_pulse_us: u32,
    /// Pulse width commanding `max_angle` degrees.
    #[serde(default = "default_max_pulse_us")]
    pub max_pulse_us: u32,
    #[serde(default = "default_max_angle")]
    pub max_angle: f32,
    /// Time the horn needs to sweep 60 degrees.
    #[serde(default = "default_slew_ms_per_60deg")]
    pub slew_ms_per_60deg: u64,
}

fn default_min_pulse_us() -> u32 {
    1000
}
fn default_max_pulse_us() -> u32 {
    2000
}
fn default_max_angle() -> f32 {
    180.0
}
fn default_slew_ms_per_60deg() -> u64 {
    200
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            min_pulse_us: default_min_pulse_us(),
            max_pulse_us: default_max_pulse_us(),
            max_angle: default_max_angle(),
            slew_ms_per_60deg: default_slew_ms_per_60deg(),
        }
    }
}

/// Step-pulse calibration for a stepper behind a DRV8825-style driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperSettings {
    /// Step pulses per unit of travel (e.g. steps per millimetre).
    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: f32,
    #[serde(default = "default_step_rate_hz")]
    pub step_rate_hz: f32,
    /// Upper bound on the length of a single pulse train.
    #[serde(default = "default_max_steps_per_move")]
    pub max_steps_per_move: u32,
}

fn default_steps_per_unit() -> f32 {
    10.0
}
fn default_step_rate_hz() -> f32 {
    1500.0
}
fn default_max_steps_per_move() -> u32 {
    4000
}

impl Default for StepperSettings {
    fn default() -> Self {
        Self {
            steps_per_unit: default_steps_per_unit(),
            step_rate_hz: default_step_rate_hz(),
            max_steps_per_move: default_max_steps_per_move(),
        }
    }
}

/// Which concrete driver backs an actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverSettings {
    Servo(ServoSettings),
    Stepper(StepperSettings),
}

impl DriverSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            DriverSettings::Servo(_) => "servo",
            DriverSettings::Stepper(_) => "stepper",
        }
    }
}

/// Immutable per-actuator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorProfile {
    pub id: String,
    /// PWM / step output index on the controller.
    pub channel: u8,
    pub rest_position: f32,
    /// Absolute target or relative offset depending on `drive_mode`.
    pub activation_position: f32,
    pub activation_duration: Duration,
    pub min_interval: Duration,
    pub safe_range: PositionRange,
    pub drive_mode: DriveMode,
    /// Classification label that triggers this actuator, if any.
    pub category: Option<String>,
    pub max_temperature_c: f32,
    /// How long the driver waits for position feedback after a command.
    pub confirm_timeout: Duration,
    /// Maximum distance between commanded and reported position.
    pub confirm_tolerance: f32,
    pub driver: DriverSettings,
}

impl ActuatorProfile {
    /// Check the profile in isolation.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.id.as_str();
        if id.trim().is_empty() {
            return Err(ConfigError::EmptyActuatorId);
        }

        for (field, value) in [
            ("rest_position", self.rest_position),
            ("activation_position", self.activation_position),
            ("safe_range.min", self.safe_range.min),
            ("safe_range.max", self.safe_range.max),
            ("max_temperature_c", self.max_temperature_c),
            ("confirm_tolerance", self.confirm_tolerance),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite {
                    actuator: id.to_string(),
                    field,
                });
            }
        }

        if self.safe_range.min >= self.safe_range.max {
            return Err(ConfigError::InvalidRange {
                actuator: id.to_string(),
                min: self.safe_range.min,
                max: self.safe_range.max,
            });
        }

        if !self.safe_range.contains(self.rest_position) {
            return Err(self.out_of_range("rest_position", self.rest_position));
        }

        match self.drive_mode {
            DriveMode::Absolute => {
                if !self.safe_range.contains(self.activation_position) {
                    return Err(
                        self.out_of_range("activation_position", self.activation_position)
                    );
                }
            }
            DriveMode::Relative => {
                let offset = self.activation_position.abs();
                if offset == 0.0 || offset > self.safe_range.width() {
                    return Err(ConfigError::InvalidOffset {
                        actuator: id.to_string(),
                        offset: self.activation_position,
                        width: self.safe_range.width(),
                    });
                }
            }
        }

        if self.activation_duration.is_zero() {
            return Err(ConfigError::ZeroDuration {
                actuator: id.to_string(),
            });
        }

        if self.max_temperature_c <= 0.0 {
            return Err(ConfigError::InvalidDriver {
                actuator: id.to_string(),
                details: format!("max_temperature_c must be positive, got {}", self.max_temperature_c),
            });
        }

        if self.confirm_tolerance < 0.0 {
            return Err(ConfigError::InvalidDriver {
                actuator: id.to_string(),
                details: "confirm_tolerance must not be negative".to_string(),
            });
        }

        if let Some(category) = &self.category
            && category.trim().is_empty()
        {
            return Err(ConfigError::InvalidDriver {
                actuator: id.to_string(),
                details: "category must not be blank".to_string(),
            });
        }

        self.validate_driver()
    }

    fn validate_driver(&self) -> Result<(), ConfigError> {
        let invalid = |details: String| ConfigError::InvalidDriver {
            actuator: self.id.clone(),
            details,
        };

        match &self.driver {
            DriverSettings::Servo(servo) => {
                if self.drive_mode == DriveMode::Relative {
                    return Err(ConfigError::UnsupportedDriveMode {
                        actuator: self.id.clone(),
                        driver: "servo",
                        mode: DriveMode::Relative,
                    });
                }
                if servo.min_pulse_us >= servo.max_pulse_us {
                    return Err(invalid(format!(
                        "min_pulse_us {} must be below max_pulse_us {}",
                        servo.min_pulse_us, servo.max_pulse_us
                    )));
                }
                if !(servo.max_angle.is_finite() && servo.max_angle > 0.0) {
                    return Err(invalid(format!("max_angle {} must be positive", servo.max_angle)));
                }
                if self.safe_range.min < 0.0 || self.safe_range.max > servo.max_angle {
                    return Err(invalid(format!(
                        "safe_range [{}, {}] exceeds servo travel [0, {}]",
                        self.safe_range.min, self.safe_range.max, servo.max_angle
                    )));
                }
            }
            DriverSettings::Stepper(stepper) => {
                if !(stepper.steps_per_unit.is_finite() && stepper.steps_per_unit > 0.0) {
                    return Err(invalid(format!(
                        "steps_per_unit {} must be positive",
                        stepper.steps_per_unit
                    )));
                }
                if !(stepper.step_rate_hz.is_finite() && stepper.step_rate_hz > 0.0) {
                    return Err(invalid(format!(
                        "step_rate_hz {} must be positive",
                        stepper.step_rate_hz
                    )));
                }
                if stepper.max_steps_per_move == 0 {
                    return Err(invalid("max_steps_per_move must be positive".to_string()));
                }
            }
        }
        Ok(())
    }

    fn out_of_range(&self, field: &'static str, value: f32) -> ConfigError {
        ConfigError::PositionOutOfRange {
            actuator: self.id.clone(),
            field,
            value,
            min: self.safe_range.min,
            max: self.safe_range.max,
        }
    }
}

/// Fixed table of validated profiles, indexed by id and by category.
#[derive(Debug, Clone)]
pub struct ActuatorTable {
    profiles: Vec<ActuatorProfile>,
    by_id: HashMap<String, usize>,
    by_category: HashMap<String, usize>,
    default_actuator: Option<usize>,
}

impl ActuatorTable {
    /// Validate `profiles` and build the lookup indexes.
    ///
    /// `default_actuator` names the actuator that receives trigger events
    /// carrying no category (raw sensor pulses).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for the first invalid profile, for duplicate
    /// ids, channels or categories, and for an unknown default actuator.
    pub fn new(
        profiles: Vec<ActuatorProfile>,
        default_actuator: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if profiles.is_empty() {
            return Err(ConfigError::EmptyTable);
        }

        let mut by_id = HashMap::new();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut by_channel: HashMap<u8, usize> = HashMap::new();

        for (index, profile) in profiles.iter().enumerate() {
            profile.validate()?;

            if by_id.insert(profile.id.clone(), index).is_some() {
                return Err(ConfigError::DuplicateActuator(profile.id.clone()));
            }
            if let Some(&first) = by_channel.get(&profile.channel) {
                return Err(ConfigError::DuplicateChannel {
                    channel: profile.channel,
                    first: profiles[first].id.clone(),
                    second: profile.id.clone(),
                });
            }
            by_channel.insert(profile.channel, index);

            if let Some(category) = &profile.category {
                if let Some(&first) = by_category.get(category) {
                    return Err(ConfigError::DuplicateCategory {
                        category: category.clone(),
                        first: profiles[first].id.clone(),
                        second: profile.id.clone(),
                    });
                }
                by_category.insert(category.clone(), index);
            }
        }

        let default_actuator = match default_actuator {
            Some(id) => Some(
                *by_id
                    .get(id)
                    .ok_or_else(|| ConfigError::UnknownDefaultActuator(id.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            profiles,
            by_id,
            by_category,
            default_actuator,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ActuatorProfile> {
        self.by_id.get(id).map(|&i| &self.profiles[i])
    }

    /// The profile whose `category` equals `category`.
    pub fn for_category(&self, category: &str) -> Option<&ActuatorProfile> {
        self.by_category.get(category).map(|&i| &self.profiles[i])
    }

    pub fn default_actuator(&self) -> Option<&ActuatorProfile> {
        self.default_actuator.map(|i| &self.profiles[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActuatorProfile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
