//! `sortline-kernel` – Safety & Admission
//!
//! Pure decision logic with no I/O and no tasks of its own.  The runtime
//! calls into it at the moment of dispatch and on every safety tick.
//!
//! # Modules
//!
//! - [`admission`] – [`AdmissionGate`][admission::AdmissionGate]: the ordered
//!   per-actuator checks (emergency stop, degraded, in-flight, minimum
//!   interval) and target resolution against the safe range.
//! - [`safety_latch`] – [`SafetyLatch`][safety_latch::SafetyLatch]: the
//!   process-wide latched [`SafetyState`][sortline_types::SafetyState].
//! - [`safety_rules`] – [`SafetyVerifier`][safety_rules::SafetyVerifier]: a
//!   rule engine evaluated against sampled actuator state (temperature,
//!   position feedback, external stop input).
//! - [`debouncer`] – [`SensorDebouncer`][debouncer::SensorDebouncer]: turns
//!   raw sensor edges into at most one trigger per physical pass.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: flags sensor channels
//!   that fell silent while the belt was running.

pub mod admission;
pub mod debouncer;
pub mod safety_latch;
pub mod safety_rules;
pub mod watchdog;

pub use admission::{AdmissionContext, AdmissionGate, resolve_target};
pub use debouncer::{DebouncePhase, SensorConfig, SensorDebouncer};
pub use safety_latch::SafetyLatch;
pub use safety_rules::{
    ActuatorSample, ExternalStopRule, OverTemperatureRule, PositionFeedbackRule, Rule,
    SafetySnapshot, SafetyVerifier, SafetyViolation,
};
pub use watchdog::{ComponentHealth, Watchdog};
