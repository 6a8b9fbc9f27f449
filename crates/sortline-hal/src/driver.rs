//! Generic [`ActuatorDriver`] trait for the labeling stepper and the diverter
//! servos.
//!
//! A driver owns exactly one [`OutputChannel`] and the [`ActuatorState`] of
//! its actuator.  The runtime hands each driver to a single owning task, so
//! no two callers can command the same channel concurrently.

use std::time::Duration;

use async_trait::async_trait;
use sortline_types::{ActivationRequest, ActuatorProfile, ActuatorState, DriverError};
use tracing::debug;

use crate::output::{Feedback, OutputChannel, OutputSignal};

/// A position-controlled actuator behind one output channel.
#[async_trait]
pub trait ActuatorDriver: Send + Sync {
    /// Actuator id from the profile, e.g. `"apple"` or `"stepper1"`.
    fn id(&self) -> &str;

    /// Start one activation cycle: record it in the state and drive the
    /// output to `request.target_position`.
    ///
    /// The bookkeeping (`is_active`, `last_activation`, `activation_count`)
    /// is updated before the hardware is touched, so a failed activation
    /// still counts towards the minimum re-trigger interval.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoConfirmation`] when feedback is missing or disagrees
    /// with the command beyond tolerance, [`DriverError::Unavailable`] when
    /// the output daemon cannot be reached.
    async fn activate(&mut self, request: &ActivationRequest) -> Result<(), DriverError>;

    /// Drive the output to an absolute `position` and wait for confirmation.
    async fn move_to(&mut self, position: f32) -> Result<(), DriverError>;

    /// Release the output and mark the actuator idle.
    ///
    /// `is_active` is cleared even when the release signal could not be
    /// delivered.
    async fn stop(&mut self) -> Result<(), DriverError>;

    /// Read fresh feedback (temperature and measured position) into the state
    /// and return a copy of it.
    async fn sample(&mut self) -> Result<ActuatorState, DriverError>;

    /// Copy of the last known state.
    fn current_state(&self) -> ActuatorState;

    fn set_degraded(&mut self, degraded: bool);
}

/// State and channel plumbing shared by the concrete drivers.
pub struct DriverCore {
    channel: Box<dyn OutputChannel>,
    state: ActuatorState,
    tolerance: f32,
    confirm_timeout: Duration,
}

impl DriverCore {
    pub fn new(profile: &ActuatorProfile, channel: Box<dyn OutputChannel>) -> Self {
        Self {
            channel,
            state: ActuatorState::at_rest(profile.id.clone(), profile.rest_position),
            tolerance: profile.confirm_tolerance,
            confirm_timeout: profile.confirm_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.state.actuator_id
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ActuatorState {
        &mut self.state
    }

    /// Record the start of an activation cycle.
    pub fn begin(&mut self, request: &ActivationRequest) {
        self.state.record_dispatch(request.scheduled_start);
    }

    pub async fn write(&self, signal: OutputSignal) -> Result<(), DriverError> {
        debug!(actuator = %self.state.actuator_id, channel = self.channel.channel(), ?signal, "output write");
        self.channel.write(signal).await
    }

    /// Read feedback, bounded by the profile's confirmation timeout.
    ///
    /// Updates the recorded temperature.  A timeout is reported as
    /// [`DriverError::NoConfirmation`] with no observed position.
    pub async fn read_feedback(&mut self, expected: f32) -> Result<Feedback, DriverError> {
        let feedback = tokio::time::timeout(self.confirm_timeout, self.channel.feedback())
            .await
            .map_err(|_| DriverError::NoConfirmation {
                expected,
                observed: None,
            })??;
        self.state.temperature_c = feedback.temperature_c;
        Ok(feedback)
    }

    /// Check an observed position against the commanded one and record it.
    pub fn confirm(&mut self, expected: f32, observed: Option<f32>) -> Result<(), DriverError> {
        match observed {
            Some(position) => {
                self.state.current_position = position;
                if (position - expected).abs() <= self.tolerance {
                    Ok(())
                } else {
                    Err(DriverError::NoConfirmation {
                        expected,
                        observed: Some(position),
                    })
                }
            }
            None => {
                // Nothing better than the command to go on.
                self.state.current_position = expected;
                Err(DriverError::NoConfirmation {
                    expected,
                    observed: None,
                })
            }
        }
    }

    /// Write [`OutputSignal::Release`] and clear `is_active`.
    pub async fn release(&mut self) -> Result<(), DriverError> {
        self.state.is_active = false;
        self.write(OutputSignal::Release).await
    }
}
