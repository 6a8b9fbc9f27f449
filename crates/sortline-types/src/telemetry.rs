//! Versioned telemetry snapshot consumed by dashboards and logs.
//!
//! Field names are camelCase on the wire and [`SCHEMA_VERSION`] is bumped on
//! any incompatible change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ActuatorState, RejectReason, SafetyState};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorTelemetry {
    pub actuator_id: String,
    pub current_position: f32,
    pub is_active: bool,
    pub activation_count: u64,
    pub temperature_c: f32,
    pub degraded: bool,
}

impl From<&ActuatorState> for ActuatorTelemetry {
    fn from(state: &ActuatorState) -> Self {
        Self {
            actuator_id: state.actuator_id.clone(),
            current_position: state.current_position,
            is_active: state.is_active,
            activation_count: state.activation_count,
            temperature_c: state.temperature_c,
            degraded: state.degraded,
        }
    }
}

/// Admission counters since process start.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCounters {
    pub admitted: u64,
    pub rejected: BTreeMap<RejectReason, u64>,
}

impl DispatchCounters {
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub schema_version: u32,
    pub taken_at: DateTime<Utc>,
    pub actuators: Vec<ActuatorTelemetry>,
    pub safety: SafetyState,
    pub dispatch: DispatchCounters,
    /// Snapshots the sink could not accept so far.
    pub dropped_snapshots: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_wire_format_is_camel_case_and_versioned() {
        let state = ActuatorState::at_rest("apple", 0.0);
        let mut dispatch = DispatchCounters::default();
        dispatch.rejected.insert(RejectReason::ActuatorBusy, 2);
        let snap = TelemetrySnapshot {
            schema_version: SCHEMA_VERSION,
            taken_at: Utc::now(),
            actuators: vec![ActuatorTelemetry::from(&state)],
            safety: SafetyState::default(),
            dispatch,
            dropped_snapshots: 0,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["actuators"][0]["actuatorId"], "apple");
        assert_eq!(json["actuators"][0]["temperatureC"], 0.0);
        assert_eq!(json["dispatch"]["rejected"]["ActuatorBusy"], 2);
        assert_eq!(json["safety"]["emergencyStopped"], false);
    }

    #[test]
    fn counters_default_to_zero() {
        let c = DispatchCounters::default();
        assert_eq!(c.rejected(RejectReason::EmergencyStopped), 0);
        assert_eq!(c.total_rejected(), 0);
    }
}
