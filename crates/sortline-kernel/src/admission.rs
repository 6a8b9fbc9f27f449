//! [`AdmissionGate`] – single interception point between a matched trigger
//! and the actuator driver.
//!
//! The owning task of each actuator calls [`AdmissionGate::evaluate`] at the
//! moment of dispatch, with the emergency-stop flag read at that same moment.
//! The checks run in a fixed order and the first failure wins:
//!
//! 1. **Emergency stop** – [`RejectReason::EmergencyStopped`].
//! 2. **Degraded actuator** – [`RejectReason::ActuatorDegraded`].
//! 3. **In-flight activation** – [`RejectReason::DuplicateSuppressed`] when
//!    the running activation came from the other trigger source (the same
//!    item seen by both the sensor and the classifier),
//!    [`RejectReason::ActuatorBusy`] otherwise.
//! 4. **Minimum interval** – [`RejectReason::IntervalNotElapsed`].
//!
//! Only then is the target resolved against the safe range
//! ([`RejectReason::TargetOutOfRange`]) and an [`ActivationRequest`] built.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use sortline_kernel::{AdmissionContext, AdmissionGate};
//! use sortline_types::*;
//! use tokio::time::Instant;
//!
//! let profile = ActuatorProfile {
//!     id: "apple".into(),
//!     channel: 12,
//!     rest_position: 0.0,
//!     activation_position: 90.0,
//!     activation_duration: Duration::from_millis(400),
//!     min_interval: Duration::from_millis(150),
//!     safe_range: PositionRange::new(0.0, 120.0),
//!     drive_mode: DriveMode::Absolute,
//!     category: Some("apple".into()),
//!     max_temperature_c: 65.0,
//!     confirm_timeout: Duration::from_millis(50),
//!     confirm_tolerance: 2.0,
//!     driver: DriverSettings::Servo(ServoSettings::default()),
//! };
//! let state = ActuatorState::at_rest("apple", 0.0);
//! let now = Instant::now();
//!
//! let ctx = AdmissionContext {
//!     profile: &profile,
//!     state: &state,
//!     emergency_stopped: false,
//!     in_flight: None,
//!     source: TriggerSource::Classification,
//!     now,
//! };
//! assert!(AdmissionGate::new().evaluate(&ctx).is_admitted());
//!
//! let stopped = AdmissionContext { emergency_stopped: true, ..ctx };
//! assert_eq!(
//!     AdmissionGate::new().evaluate(&stopped).reject_reason(),
//!     Some(RejectReason::EmergencyStopped)
//! );
//! ```

use sortline_types::{
    ActivationRequest, ActuatorProfile, ActuatorState, Admission, DriveMode, RejectReason,
    TriggerSource,
};
use tokio::time::Instant;

/// Everything the gate needs to decide on one trigger for one actuator.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub profile: &'a ActuatorProfile,
    pub state: &'a ActuatorState,
    /// Latch value read at the moment of dispatch.
    pub emergency_stopped: bool,
    /// Source of the activation currently running, if any.
    pub in_flight: Option<TriggerSource>,
    pub source: TriggerSource,
    pub now: Instant,
}

/// Ordered admission checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionGate;

impl AdmissionGate {
    pub fn new() -> Self {
        Self
    }

    /// Run the ordered checks without resolving the target.
    ///
    /// # Errors
    ///
    /// The [`RejectReason`] of the first failing check.
    pub fn admit(&self, ctx: &AdmissionContext<'_>) -> Result<(), RejectReason> {
        if ctx.emergency_stopped {
            return Err(RejectReason::EmergencyStopped);
        }
        if ctx.state.degraded {
            return Err(RejectReason::ActuatorDegraded);
        }
        if let Some(running) = ctx.in_flight {
            return Err(if running == ctx.source {
                RejectReason::ActuatorBusy
            } else {
                RejectReason::DuplicateSuppressed
            });
        }
        if let Some(last) = ctx.state.last_activation
            && ctx.now.saturating_duration_since(last) < ctx.profile.min_interval
        {
            return Err(RejectReason::IntervalNotElapsed);
        }
        Ok(())
    }

    /// Admit and build the [`ActivationRequest`] scheduled at `ctx.now`.
    pub fn evaluate(&self, ctx: &AdmissionContext<'_>) -> Admission {
        let outcome = self.admit(ctx).and_then(|()| {
            let target_position = resolve_target(ctx.profile, ctx.state.current_position)?;
            Ok(ActivationRequest {
                actuator_id: ctx.profile.id.clone(),
                scheduled_start: ctx.now,
                duration: ctx.profile.activation_duration,
                target_position,
                source: ctx.source,
            })
        });
        match outcome {
            Ok(request) => Admission::Admitted(request),
            Err(reason) => Admission::Rejected(reason),
        }
    }
}

/// Resolve the commanded position for an activation.
///
/// `Absolute` profiles command `activation_position` directly and refuse a
/// target outside the safe range.  `Relative` profiles offset from
/// `current_position` and clamp the result into the safe range, so repeated
/// offsets can never accumulate past the limits.
///
/// # Errors
///
/// [`RejectReason::TargetOutOfRange`] for an out-of-range absolute target or
/// a non-finite position.
pub fn resolve_target(profile: &ActuatorProfile, current_position: f32) -> Result<f32, RejectReason> {
    let target = match profile.drive_mode {
        DriveMode::Absolute => profile.activation_position,
        DriveMode::Relative => {
            profile
                .safe_range
                .clamp(current_position + profile.activation_position)
        }
    };
    if target.is_finite() && profile.safe_range.contains(target) {
        Ok(target)
    } else {
        Err(RejectReason::TargetOutOfRange)
    }
}
