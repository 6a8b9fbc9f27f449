//! Diverter servo driver.
//!
//! Angles map linearly onto a 50 Hz pulse width between `min_pulse_us`
//! (0°) and `max_pulse_us` (`max_angle`).  After each move the driver waits
//! for the horn to slew, then reads the pulse back to confirm the angle.

use std::time::Duration;

use async_trait::async_trait;
use sortline_types::{ActivationRequest, ActuatorProfile, ActuatorState, DriverError, ServoSettings};

use crate::driver::{ActuatorDriver, DriverCore};
use crate::output::{OutputChannel, OutputSignal};

/// PWM frame length at 50 Hz.
pub const FRAME_US: u32 = 20_000;

/// Pulse width commanding `angle` degrees.
pub fn pulse_for_angle(settings: &ServoSettings, angle: f32) -> u32 {
    let span = (settings.max_pulse_us - settings.min_pulse_us) as f32;
    let angle = angle.clamp(0.0, settings.max_angle);
    settings.min_pulse_us + (angle / settings.max_angle * span).round() as u32
}

/// Angle reported by a pulse-width readback.
pub fn angle_for_pulse(settings: &ServoSettings, micros: i64) -> f32 {
    let span = (settings.max_pulse_us - settings.min_pulse_us) as f32;
    (micros - i64::from(settings.min_pulse_us)) as f32 / span * settings.max_angle
}

/// Duty cycle (0.0..=1.0) of a pulse within one 50 Hz frame.
pub fn duty_cycle(micros: u32) -> f32 {
    micros as f32 / FRAME_US as f32
}

/// Time the horn needs to sweep from `from` to `to`.
pub fn slew_time(settings: &ServoSettings, from: f32, to: f32) -> Duration {
    let ms = (to - from).abs() / 60.0 * settings.slew_ms_per_60deg as f32;
    Duration::from_micros((ms * 1000.0).round() as u64)
}

pub struct ServoDriver {
    core: DriverCore,
    settings: ServoSettings,
}

impl ServoDriver {
    pub fn new(profile: &ActuatorProfile, settings: ServoSettings, channel: Box<dyn OutputChannel>) -> Self {
        Self {
            core: DriverCore::new(profile, channel),
            settings,
        }
    }
}

#[async_trait]
impl ActuatorDriver for ServoDriver {
    fn id(&self) -> &str {
        self.core.id()
    }

    async fn activate(&mut self, request: &ActivationRequest) -> Result<(), DriverError> {
        self.core.begin(request);
        self.move_to(request.target_position).await
    }

    async fn move_to(&mut self, position: f32) -> Result<(), DriverError> {
        if !(0.0..=self.settings.max_angle).contains(&position) {
            return Err(DriverError::Rejected(format!(
                "angle {position} outside servo travel [0, {}]",
                self.settings.max_angle
            )));
        }
        let micros = pulse_for_angle(&self.settings, position);
        let from = self.core.state().current_position;
        self.core.write(OutputSignal::PulseWidth { micros }).await?;
        tokio::time::sleep(slew_time(&self.settings, from, position)).await;

        let feedback = self.core.read_feedback(position).await?;
        let observed = feedback
            .position_raw
            .map(|raw| angle_for_pulse(&self.settings, raw));
        self.core.confirm(position, observed)
    }

    async fn stop(&mut self) -> Result<(), DriverError> {
        // Releasing the pulse stops the horn from jittering at rest.
        self.core.release().await
    }

    async fn sample(&mut self) -> Result<ActuatorState, DriverError> {
        let expected = self.core.state().current_position;
        let feedback = self.core.read_feedback(expected).await?;
        if let Some(raw) = feedback.position_raw {
            self.core.state_mut().current_position = angle_for_pulse(&self.settings, raw);
        }
        Ok(self.core.state().clone())
    }

    fn current_state(&self) -> ActuatorState {
        self.core.state().clone()
    }

    fn set_degraded(&mut self, degraded: bool) {
        self.core.state_mut().degraded = degraded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimChannel;
    use sortline_types::{DriveMode, DriverSettings, PositionRange, TriggerSource};
    use tokio::time::Instant;

    fn profile(slew_ms_per_60deg: u64) -> ActuatorProfile {
        ActuatorProfile {
            id: "pear".to_string(),
            channel: 13,
            rest_position: 0.0,
            activation_position: 90.0,
            activation_duration: Duration::from_millis(400),
            min_interval: Duration::from_millis(150),
            safe_range: PositionRange::new(0.0, 120.0),
            drive_mode: DriveMode::Absolute,
            category: Some("pear".to_string()),
            max_temperature_c: 65.0,
            confirm_timeout: Duration::from_millis(50),
            confirm_tolerance: 2.0,
            driver: DriverSettings::Servo(ServoSettings {
                slew_ms_per_60deg,
                ..ServoSettings::default()
            }),
        }
    }

    fn driver(profile: &ActuatorProfile) -> (ServoDriver, crate::sim::SimProbe) {
        let (channel, probe) = SimChannel::for_profile(profile);
        let DriverSettings::Servo(settings) = profile.driver.clone() else {
            unreachable!()
        };
        (ServoDriver::new(profile, settings, Box::new(channel)), probe)
    }

    #[test]
    fn pulse_mapping_covers_full_travel() {
        let s = ServoSettings::default();
        assert_eq!(pulse_for_angle(&s, 0.0), 1000);
        assert_eq!(pulse_for_angle(&s, 90.0), 1500);
        assert_eq!(pulse_for_angle(&s, 180.0), 2000);
        assert!((angle_for_pulse(&s, 1500) - 90.0).abs() < 0.01);
        assert!((duty_cycle(1500) - 0.075).abs() < 1e-6);
    }

    #[test]
    fn slew_time_scales_with_distance() {
        let s = ServoSettings::default();
        assert_eq!(slew_time(&s, 0.0, 90.0), Duration::from_millis(300));
        assert_eq!(slew_time(&s, 90.0, 30.0), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn activate_writes_pulse_and_waits_for_slew() {
        let profile = profile(200);
        let (mut servo, probe) = driver(&profile);
        let start = Instant::now();
        servo
            .activate(&ActivationRequest {
                actuator_id: "pear".to_string(),
                scheduled_start: start,
                duration: profile.activation_duration,
                target_position: 90.0,
                source: TriggerSource::Classification,
            })
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(probe.last_signal(), Some(OutputSignal::PulseWidth { micros: 1500 }));
        let state = servo.current_state();
        assert!(state.is_active);
        assert_eq!(state.activation_count, 1);
        assert!((state.current_position - 90.0).abs() < 0.5);

        servo.move_to(0.0).await.unwrap();
        servo.stop().await.unwrap();
        assert!(!servo.current_state().is_active);
        assert_eq!(probe.last_signal(), Some(OutputSignal::Release));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_feedback_is_no_confirmation() {
        let profile = profile(0);
        let (mut servo, probe) = driver(&profile);
        probe.fail_confirmation(true);
        let err = servo.move_to(90.0).await.unwrap_err();
        assert_eq!(
            err,
            DriverError::NoConfirmation {
                expected: 90.0,
                observed: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sample_reads_temperature() {
        let profile = profile(0);
        let (mut servo, probe) = driver(&profile);
        probe.set_temperature(48.5);
        let state = servo.sample().await.unwrap();
        assert!((state.temperature_c - 48.5).abs() < f32::EPSILON);
        assert!(state.current_position.abs() < 0.5);
    }

    #[tokio::test]
    async fn angle_outside_travel_is_rejected_without_writing() {
        let profile = profile(0);
        let (mut servo, probe) = driver(&profile);
        assert!(matches!(servo.move_to(200.0).await, Err(DriverError::Rejected(_))));
        assert!(probe.history().is_empty());
    }
}
