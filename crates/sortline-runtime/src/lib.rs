//! `sortline-runtime` – The Actuation Engine
//!
//! Turns trigger events into bounded, safety-checked actuator motions.
//!
//! # Modules
//!
//! - [`engine`] – [`SortingEngine`][engine::SortingEngine]: builds one task
//!   per actuator, the scheduler, the safety monitor, the telemetry
//!   publisher and the sensor task, and returns a cloneable
//!   [`EngineHandle`][engine::EngineHandle].
//! - [`actuator_task`] – [`ActuatorHandle`][actuator_task::ActuatorHandle]:
//!   the single owner of each driver.  Admission runs here, at the moment of
//!   dispatch, and every activation ends with a return to rest.
//! - [`scheduler`] – [`ActuationScheduler`][scheduler::ActuationScheduler]:
//!   matches events to actuators by category and counts admissions and
//!   rejections in [`DispatchStats`][scheduler::DispatchStats].
//! - [`safety_monitor`] – [`SafetyMonitor`][safety_monitor::SafetyMonitor]:
//!   periodic verification, the latched emergency stop and its guarded
//!   reset.
//! - [`publisher`] – [`TelemetryPublisher`][publisher::TelemetryPublisher]:
//!   periodic snapshots to a non-blocking sink.
//! - [`observability`] – [`init_tracing`][observability::init_tracing]:
//!   the global `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Safety gating
//!
//! No driver is reachable except through its actuator task, and the task
//! consults [`AdmissionGate`] with the latch value read at dispatch.  The
//! gate is re-exported so callers can evaluate admission offline.

pub mod actuator_task;
pub mod engine;
pub mod observability;
pub mod publisher;
pub mod safety_monitor;
pub mod scheduler;

pub use actuator_task::ActuatorHandle;
pub use engine::{EngineConfig, EngineHandle, SortingEngine};
pub use observability::{TracerProviderGuard, init_tracing};
pub use publisher::TelemetryPublisher;
pub use safety_monitor::SafetyMonitor;
pub use scheduler::{ActuationScheduler, DispatchStats};

pub use sortline_kernel::AdmissionGate;
