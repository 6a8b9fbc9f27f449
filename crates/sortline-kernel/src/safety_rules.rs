//! [`SafetyVerifier`] – physical safety interlock / rule engine.
//!
//! On every safety tick the runtime samples each actuator and builds a
//! [`SafetySnapshot`].  Every registered [`Rule`] is evaluated in order; the
//! first violation is returned and the monitor engages the emergency stop.
//! The same verifier re-validates the line before an operator reset is
//! allowed to clear the latch.
//!
//! Built-in rules:
//! - [`ExternalStopRule`] – the hardware e-stop input is asserted.
//! - [`OverTemperatureRule`] – an actuator is hotter than its profile limit.
//! - [`PositionFeedbackRule`] – reported position lies outside the safe
//!   range by more than the confirmation tolerance.

use sortline_types::{ActuatorProfile, ActuatorState, PositionRange};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyViolation {
    #[error("external emergency-stop input asserted")]
    ExternalStop,

    #[error("{actuator} at {temperature_c}°C exceeds limit {limit_c}°C")]
    OverTemperature {
        actuator: String,
        temperature_c: f32,
        limit_c: f32,
    },

    #[error("{actuator} reports position {position} outside [{min}, {max}]")]
    PositionOutOfRange {
        actuator: String,
        position: f32,
        min: f32,
        max: f32,
    },

    #[error("{0} is still active")]
    ActuatorActive(String),
}

/// Sampled state of one actuator plus the limits it is checked against.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorSample {
    pub state: ActuatorState,
    pub max_temperature_c: f32,
    pub safe_range: PositionRange,
    pub tolerance: f32,
}

impl ActuatorSample {
    pub fn new(profile: &ActuatorProfile, state: ActuatorState) -> Self {
        Self {
            state,
            max_temperature_c: profile.max_temperature_c,
            safe_range: profile.safe_range,
            tolerance: profile.confirm_tolerance,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafetySnapshot {
    pub actuators: Vec<ActuatorSample>,
    pub external_stop: bool,
}

/// A single physical invariant the line must satisfy.
pub trait Rule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    fn check(&self, snapshot: &SafetySnapshot) -> Result<(), SafetyViolation>;
}

/// Rule engine over [`SafetySnapshot`]s.
///
/// # Example
///
/// ```
/// use sortline_kernel::safety_rules::{SafetySnapshot, SafetyVerifier, SafetyViolation};
///
/// let verifier = SafetyVerifier::with_default_rules();
/// assert!(verifier.verify(&SafetySnapshot::default()).is_ok());
///
/// let stop = SafetySnapshot { external_stop: true, ..Default::default() };
/// assert_eq!(verifier.verify(&stop), Err(SafetyViolation::ExternalStop));
/// ```
#[derive(Default)]
pub struct SafetyVerifier {
    rules: Vec<Box<dyn Rule>>,
}

impl SafetyVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// External stop, over-temperature, position feedback.
    pub fn with_default_rules() -> Self {
        let mut verifier = Self::new();
        verifier.add_rule(Box::new(ExternalStopRule));
        verifier.add_rule(Box::new(OverTemperatureRule));
        verifier.add_rule(Box::new(PositionFeedbackRule));
        verifier
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, snapshot: &SafetySnapshot) -> Result<(), SafetyViolation> {
        for rule in &self.rules {
            rule.check(snapshot)?;
        }
        Ok(())
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

pub struct ExternalStopRule;

impl Rule for ExternalStopRule {
    fn name(&self) -> &str {
        "external_stop"
    }

    fn check(&self, snapshot: &SafetySnapshot) -> Result<(), SafetyViolation> {
        if snapshot.external_stop {
            return Err(SafetyViolation::ExternalStop);
        }
        Ok(())
    }
}

pub struct OverTemperatureRule;

impl Rule for OverTemperatureRule {
    fn name(&self) -> &str {
        "over_temperature"
    }

    fn check(&self, snapshot: &SafetySnapshot) -> Result<(), SafetyViolation> {
        for sample in &snapshot.actuators {
            let temperature_c = sample.state.temperature_c;
            // A NaN reading is treated as over the limit.
            if temperature_c.is_nan() || temperature_c > sample.max_temperature_c {
                return Err(SafetyViolation::OverTemperature {
                    actuator: sample.state.actuator_id.clone(),
                    temperature_c,
                    limit_c: sample.max_temperature_c,
                });
            }
        }
        Ok(())
    }
}

pub struct PositionFeedbackRule;

impl Rule for PositionFeedbackRule {
    fn name(&self) -> &str {
        "position_feedback"
    }

    fn check(&self, snapshot: &SafetySnapshot) -> Result<(), SafetyViolation> {
        for sample in &snapshot.actuators {
            let position = sample.state.current_position;
            let range = sample.safe_range;
            if position < range.min - sample.tolerance || position > range.max + sample.tolerance {
                return Err(SafetyViolation::PositionOutOfRange {
                    actuator: sample.state.actuator_id.clone(),
                    position,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, temperature_c: f32, position: f32) -> ActuatorSample {
        let mut state = ActuatorState::at_rest(id, 0.0);
        state.temperature_c = temperature_c;
        state.current_position = position;
        ActuatorSample {
            state,
            max_temperature_c: 65.0,
            safe_range: PositionRange::new(0.0, 50.0),
            tolerance: 0.5,
        }
    }

    #[test]
    fn healthy_line_passes() {
        let v = SafetyVerifier::with_default_rules();
        let snap = SafetySnapshot {
            actuators: vec![sample("apple", 40.0, 10.0), sample("stepper1", 65.0, 50.4)],
            external_stop: false,
        };
        assert!(v.verify(&snap).is_ok());
        assert_eq!(
            v.rule_names(),
            vec!["external_stop", "over_temperature", "position_feedback"]
        );
    }

    #[test]
    fn over_temperature_names_the_actuator() {
        let v = SafetyVerifier::with_default_rules();
        let snap = SafetySnapshot {
            actuators: vec![sample("apple", 30.0, 0.0), sample("stepper1", 70.0, 0.0)],
            external_stop: false,
        };
        let err = v.verify(&snap).unwrap_err();
        assert_eq!(
            err,
            SafetyViolation::OverTemperature {
                actuator: "stepper1".to_string(),
                temperature_c: 70.0,
                limit_c: 65.0
            }
        );
        assert!(err.to_string().contains("stepper1"));
    }

    #[test]
    fn nan_temperature_is_a_violation() {
        let snap = SafetySnapshot {
            actuators: vec![sample("apple", f32::NAN, 0.0)],
            external_stop: false,
        };
        assert!(OverTemperatureRule.check(&snap).is_err());
    }

    #[test]
    fn position_beyond_tolerance_is_a_violation() {
        let snap = SafetySnapshot {
            actuators: vec![sample("stepper1", 25.0, 51.0)],
            external_stop: false,
        };
        assert!(matches!(
            PositionFeedbackRule.check(&snap),
            Err(SafetyViolation::PositionOutOfRange { .. })
        ));
    }

    #[test]
    fn external_stop_is_checked_first() {
        let v = SafetyVerifier::with_default_rules();
        let snap = SafetySnapshot {
            actuators: vec![sample("stepper1", 90.0, 0.0)],
            external_stop: true,
        };
        assert_eq!(v.verify(&snap), Err(SafetyViolation::ExternalStop));
    }
}
