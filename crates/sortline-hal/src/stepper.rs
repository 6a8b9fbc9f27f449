//! Labeling-head stepper driver.
//!
//! Travel is converted to step pulses at `steps_per_unit` and emitted at a
//! fixed `step_rate_hz`.  Long moves are split into trains of at most
//! `max_steps_per_move` pulses; each train is confirmed against the step
//! counter before the next one is sent.

use std::time::Duration;

use async_trait::async_trait;
use sortline_types::{
    ActivationRequest, ActuatorProfile, ActuatorState, DriverError, StepperSettings,
};
use tracing::debug;

use crate::driver::{ActuatorDriver, DriverCore};
use crate::output::{OutputChannel, OutputSignal};

/// Time needed to emit `steps` pulses at `rate_hz`.
pub fn train_time(steps: u32, rate_hz: f32) -> Duration {
    Duration::from_secs_f64(f64::from(steps) / f64::from(rate_hz))
}

pub struct StepperDriver {
    core: DriverCore,
    settings: StepperSettings,
}

impl StepperDriver {
    pub fn new(
        profile: &ActuatorProfile,
        settings: StepperSettings,
        channel: Box<dyn OutputChannel>,
    ) -> Self {
        Self {
            core: DriverCore::new(profile, channel),
            settings,
        }
    }

    fn to_units(&self, steps: i64) -> f32 {
        steps as f32 / self.settings.steps_per_unit
    }
}

#[async_trait]
impl ActuatorDriver for StepperDriver {
    fn id(&self) -> &str {
        self.core.id()
    }

    async fn activate(&mut self, request: &ActivationRequest) -> Result<(), DriverError> {
        self.core.begin(request);
        self.move_to(request.target_position).await
    }

    async fn move_to(&mut self, position: f32) -> Result<(), DriverError> {
        let from = self.core.state().current_position;
        let delta = position - from;
        let forward = delta > 0.0;
        let mut remaining = (delta.abs() * self.settings.steps_per_unit).round() as u32;
        if remaining == 0 {
            return Ok(());
        }

        let origin_steps = (from * self.settings.steps_per_unit).round() as i64;
        let mut travelled: i64 = 0;
        while remaining > 0 {
            let steps = remaining.min(self.settings.max_steps_per_move);
            debug!(actuator = %self.core.id(), steps, forward, "step train");
            self.core
                .write(OutputSignal::StepTrain {
                    forward,
                    steps,
                    rate_hz: self.settings.step_rate_hz,
                })
                .await?;
            tokio::time::sleep(train_time(steps, self.settings.step_rate_hz)).await;

            travelled += if forward { i64::from(steps) } else { -i64::from(steps) };
            let expected = self.to_units(origin_steps + travelled);
            let feedback = self.core.read_feedback(expected).await?;
            let observed = feedback.position_raw.map(|raw| self.to_units(raw));
            self.core.confirm(expected, observed)?;
            remaining -= steps;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DriverError> {
        self.core.release().await
    }

    async fn sample(&mut self) -> Result<ActuatorState, DriverError> {
        let expected = self.core.state().current_position;
        let feedback = self.core.read_feedback(expected).await?;
        if let Some(raw) = feedback.position_raw {
            let position = self.to_units(raw);
            self.core.state_mut().current_position = position;
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
    use crate::sim::{SimChannel, SimProbe};
    use sortline_types::{DriveMode, DriverSettings, PositionRange, TriggerSource};
    use tokio::time::Instant;

    fn profile(max_steps_per_move: u32) -> ActuatorProfile {
        ActuatorProfile {
            id: "stepper1".to_string(),
            channel: 19,
            rest_position: 0.0,
            activation_position: 25.0,
            activation_duration: Duration::from_millis(600),
            min_interval: Duration::from_millis(150),
            safe_range: PositionRange::new(0.0, 50.0),
            drive_mode: DriveMode::Relative,
            category: None,
            max_temperature_c: 65.0,
            confirm_timeout: Duration::from_millis(50),
            confirm_tolerance: 0.5,
            driver: DriverSettings::Stepper(StepperSettings {
                steps_per_unit: 10.0,
                step_rate_hz: 1000.0,
                max_steps_per_move,
            }),
        }
    }

    fn driver(profile: &ActuatorProfile) -> (StepperDriver, SimProbe) {
        let (channel, probe) = SimChannel::for_profile(profile);
        let DriverSettings::Stepper(settings) = profile.driver.clone() else {
            unreachable!()
        };
        (StepperDriver::new(profile, settings, Box::new(channel)), probe)
    }

    #[tokio::test(start_paused = true)]
    async fn activate_emits_timed_step_train() {
        let profile = profile(4000);
        let (mut stepper, probe) = driver(&profile);
        let start = Instant::now();
        stepper
            .activate(&ActivationRequest {
                actuator_id: "stepper1".to_string(),
                scheduled_start: start,
                duration: profile.activation_duration,
                target_position: 25.0,
                source: TriggerSource::Sensor,
            })
            .await
            .unwrap();

        // 250 steps at 1 kHz.
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(
            probe.last_signal(),
            Some(OutputSignal::StepTrain {
                forward: true,
                steps: 250,
                rate_hz: 1000.0
            })
        );
        assert!((stepper.current_state().current_position - 25.0).abs() < f32::EPSILON);

        stepper.move_to(0.0).await.unwrap();
        assert_eq!(probe.position_raw(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn long_moves_are_split_into_bounded_trains() {
        let profile = profile(100);
        let (mut stepper, probe) = driver(&profile);
        stepper.move_to(25.0).await.unwrap();

        let trains: Vec<u32> = probe
            .history()
            .iter()
            .filter_map(|r| match r.signal {
                OutputSignal::StepTrain { steps, .. } => Some(steps),
                _ => None,
            })
            .collect();
        assert_eq!(trains, vec![100, 100, 50]);
        assert_eq!(probe.position_raw(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_daemon_surfaces_unavailable() {
        let profile = profile(4000);
        let (mut stepper, probe) = driver(&profile);
        probe.set_unavailable(true);
        assert!(matches!(
            stepper.move_to(10.0).await,
            Err(DriverError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_travel_sends_nothing() {
        let profile = profile(4000);
        let (mut stepper, probe) = driver(&profile);
        stepper.move_to(0.0).await.unwrap();
        assert!(probe.history().is_empty());
    }
}
