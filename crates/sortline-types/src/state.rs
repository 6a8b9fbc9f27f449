//! Mutable runtime state: per-actuator state, the process-wide safety state,
//! activation requests and admission rejection codes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::trigger::TriggerSource;

/// One activation cycle for one actuator.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRequest {
    pub actuator_id: String,
    pub scheduled_start: Instant,
    pub duration: Duration,
    pub target_position: f32,
    pub source: TriggerSource,
}

impl ActivationRequest {
    /// Instant at which the actuator must be commanded back to rest.
    pub fn deadline(&self) -> Instant {
        self.scheduled_start + self.duration
    }
}

/// Live state of one actuator.  Owned by its driver; everyone else sees
/// clones.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorState {
    pub actuator_id: String,
    pub current_position: f32,
    pub is_active: bool,
    pub last_activation: Option<Instant>,
    pub activation_count: u64,
    pub temperature_c: f32,
    /// Set after a communication or confirmation failure; cleared only by an
    /// explicit operator call.
    pub degraded: bool,
}

impl ActuatorState {
    /// Initial state for an actuator parked at `rest_position`.
    pub fn at_rest(actuator_id: impl Into<String>, rest_position: f32) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            current_position: rest_position,
            is_active: false,
            last_activation: None,
            activation_count: 0,
            temperature_c: 0.0,
            degraded: false,
        }
    }

    /// Record the dispatch of an activation cycle starting at `started`.
    pub fn record_dispatch(&mut self, started: Instant) {
        self.is_active = true;
        self.last_activation = Some(started);
        self.activation_count += 1;
    }
}

/// Process-wide safety state.  `emergency_stopped` is latched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyState {
    pub emergency_stopped: bool,
    pub reason: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Why an admission check dropped a trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RejectReason {
    /// No actuator is configured for the event's category (or no default).
    NoMatchingActuator,
    EmergencyStopped,
    ActuatorDegraded,
    ActuatorBusy,
    IntervalNotElapsed,
    /// The same item was already claimed by a trigger from the other source.
    DuplicateSuppressed,
    TargetOutOfRange,
}

impl RejectReason {
    pub const ALL: [RejectReason; 7] = [
        RejectReason::NoMatchingActuator,
        RejectReason::EmergencyStopped,
        RejectReason::ActuatorDegraded,
        RejectReason::ActuatorBusy,
        RejectReason::IntervalNotElapsed,
        RejectReason::DuplicateSuppressed,
        RejectReason::TargetOutOfRange,
    ];

    /// Dense index into [`RejectReason::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> &'static str {
        match self {
            RejectReason::NoMatchingActuator => "NoMatchingActuator",
            RejectReason::EmergencyStopped => "EmergencyStopped",
            RejectReason::ActuatorDegraded => "ActuatorDegraded",
            RejectReason::ActuatorBusy => "ActuatorBusy",
            RejectReason::IntervalNotElapsed => "IntervalNotElapsed",
            RejectReason::DuplicateSuppressed => "DuplicateSuppressed",
            RejectReason::TargetOutOfRange => "TargetOutOfRange",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of submitting a trigger to an actuator.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(ActivationRequest),
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Admission::Rejected(reason) => Some(*reason),
            Admission::Admitted(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_index_matches_all_table() {
        for (i, reason) in RejectReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }

    #[test]
    fn safety_state_uses_camel_case_on_the_wire() {
        let json = serde_json::to_string(&SafetyState {
            emergency_stopped: true,
            reason: Some("over temperature".into()),
            last_check: None,
        })
        .unwrap();
        assert!(json.contains("emergencyStopped"));
        assert!(json.contains("lastCheck"));
    }

    #[test]
    fn dispatch_marks_active_and_counts() {
        let mut state = ActuatorState::at_rest("stepper1", 0.0);
        let start = Instant::now();
        state.record_dispatch(start);
        state.record_dispatch(start);
        assert!(state.is_active);
        assert_eq!(state.last_activation, Some(start));
        assert_eq!(state.activation_count, 2);
        assert_eq!(state.current_position, 0.0);
    }

    #[test]
    fn deadline_is_start_plus_duration() {
        let start = Instant::now();
        let req = ActivationRequest {
            actuator_id: "apple".into(),
            scheduled_start: start,
            duration: Duration::from_millis(400),
            target_position: 90.0,
            source: TriggerSource::Classification,
        };
        assert_eq!(req.deadline(), start + Duration::from_millis(400));
    }
}
