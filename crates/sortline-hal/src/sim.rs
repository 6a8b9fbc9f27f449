//! In-process output channel for CI and bench testing without hardware.
//!
//! [`SimChannel`] behaves like an ideal controller: pulse widths and step
//! trains take effect immediately and are reported back verbatim.  The
//! paired [`SimProbe`] records every signal with its timestamp and injects
//! faults.
//!
//! | Fault | Effect |
//! |---|---|
//! | [`SimProbe::set_temperature`] | Reported in every [`Feedback`]. |
//! | [`SimProbe::fail_confirmation`] | Feedback carries no position. |
//! | [`SimProbe::set_unavailable`] | Writes and reads fail with [`DriverError::Unavailable`]. |
//!
//! # Example
//!
//! ```rust
//! use sortline_hal::sim::SimChannel;
//!
//! let (channel, probe) = SimChannel::new(12, 1000);
//! probe.set_temperature(70.0);
//! assert!(probe.history().is_empty());
//! # drop(channel);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sortline_types::{ActuatorProfile, DriverError, DriverSettings};
use tokio::time::Instant;

use crate::output::{Feedback, OutputChannel, OutputSignal};
use crate::servo::pulse_for_angle;

const AMBIENT_C: f32 = 25.0;

/// One signal written to a [`SimChannel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalRecord {
    pub at: Instant,
    pub signal: OutputSignal,
}

#[derive(Debug)]
struct SimInner {
    position_raw: i64,
    temperature_c: f32,
    confirmation_fault: bool,
    unavailable: bool,
    history: Vec<SignalRecord>,
}

/// Simulated controller output.
pub struct SimChannel {
    channel: u8,
    inner: Arc<Mutex<SimInner>>,
}

/// Test-side handle onto a [`SimChannel`].
#[derive(Clone)]
pub struct SimProbe {
    inner: Arc<Mutex<SimInner>>,
}

fn lock(inner: &Mutex<SimInner>) -> MutexGuard<'_, SimInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimChannel {
    /// Create a channel whose controller starts at `position_raw`.
    pub fn new(channel: u8, position_raw: i64) -> (Self, SimProbe) {
        let inner = Arc::new(Mutex::new(SimInner {
            position_raw,
            temperature_c: AMBIENT_C,
            confirmation_fault: false,
            unavailable: false,
            history: Vec::new(),
        }));
        (
            Self {
                channel,
                inner: Arc::clone(&inner),
            },
            SimProbe { inner },
        )
    }

    /// Channel parked at `profile.rest_position`, in the raw units of the
    /// profile's driver.
    pub fn for_profile(profile: &ActuatorProfile) -> (Self, SimProbe) {
        let raw = match &profile.driver {
            DriverSettings::Servo(servo) => i64::from(pulse_for_angle(servo, profile.rest_position)),
            DriverSettings::Stepper(stepper) => {
                (profile.rest_position * stepper.steps_per_unit).round() as i64
            }
        };
        Self::new(profile.channel, raw)
    }
}

#[async_trait]
impl OutputChannel for SimChannel {
    fn channel(&self) -> u8 {
        self.channel
    }

    async fn write(&self, signal: OutputSignal) -> Result<(), DriverError> {
        let mut inner = lock(&self.inner);
        if inner.unavailable {
            return Err(DriverError::Unavailable(format!(
                "simulated daemon offline (channel {})",
                self.channel
            )));
        }
        match signal {
            OutputSignal::PulseWidth { micros } => inner.position_raw = i64::from(micros),
            OutputSignal::StepTrain { forward, steps, .. } => {
                let steps = i64::from(steps);
                inner.position_raw += if forward { steps } else { -steps };
            }
            OutputSignal::Release => {}
        }
        inner.history.push(SignalRecord {
            at: Instant::now(),
            signal,
        });
        Ok(())
    }

    async fn feedback(&self) -> Result<Feedback, DriverError> {
        let inner = lock(&self.inner);
        if inner.unavailable {
            return Err(DriverError::Unavailable(format!(
                "simulated daemon offline (channel {})",
                self.channel
            )));
        }
        Ok(Feedback {
            position_raw: (!inner.confirmation_fault).then_some(inner.position_raw),
            temperature_c: inner.temperature_c,
        })
    }
}

impl SimProbe {
    pub fn set_temperature(&self, celsius: f32) {
        lock(&self.inner).temperature_c = celsius;
    }

    /// While set, feedback reports no position and every move fails to
    /// confirm.
    pub fn fail_confirmation(&self, fail: bool) {
        lock(&self.inner).confirmation_fault = fail;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.inner).unavailable = unavailable;
    }

    pub fn position_raw(&self) -> i64 {
        lock(&self.inner).position_raw
    }

    /// Every signal written so far, oldest first.
    pub fn history(&self) -> Vec<SignalRecord> {
        lock(&self.inner).history.clone()
    }

    pub fn last_signal(&self) -> Option<OutputSignal> {
        lock(&self.inner).history.last().map(|r| r.signal)
    }
}
