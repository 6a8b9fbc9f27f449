//! [`SafetyMonitor`] – periodic physical-state verification and the
//! emergency-stop path.
//!
//! Every tick the monitor samples each actuator through its task, stamps the
//! latch with the check time and runs the [`SafetyVerifier`].  The first
//! violation engages the [`SafetyLatch`]; engaging it aborts in-flight
//! activations (their tasks watch the latch) and every actuator is then
//! commanded to rest.  Only [`SafetyMonitor::reset_emergency_stop`] clears
//! the latch, and only after a fresh check passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use sortline_kernel::{ActuatorSample, SafetyLatch, SafetySnapshot, SafetyVerifier, SafetyViolation};
use sortline_middleware::{EventBus, Topic};
use sortline_types::{ActuatorTable, Diagnostic, DiagnosticKind, EventPayload};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::actuator_task::ActuatorHandle;

const SOURCE: &str = "sortline-runtime::safety";

/// How long a tick waits for one actuator's fresh sample before falling
/// back to its last published state.
const SAMPLE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct SafetyMonitor {
    actuators: Vec<ActuatorHandle>,
    table: Arc<ActuatorTable>,
    latch: SafetyLatch,
    verifier: Arc<SafetyVerifier>,
    bus: EventBus,
    external_stop: Arc<AtomicBool>,
}

impl SafetyMonitor {
    pub fn new(
        actuators: Vec<ActuatorHandle>,
        table: Arc<ActuatorTable>,
        latch: SafetyLatch,
        verifier: SafetyVerifier,
        bus: EventBus,
    ) -> Self {
        Self {
            actuators,
            table,
            latch,
            verifier: Arc::new(verifier),
            bus,
            external_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn latch(&self) -> &SafetyLatch {
        &self.latch
    }

    /// Record the level of the hardware emergency-stop input.  It is
    /// evaluated on the next check.
    pub fn set_external_stop(&self, asserted: bool) {
        self.external_stop.store(asserted, Ordering::SeqCst);
    }

    pub fn external_stop(&self) -> bool {
        self.external_stop.load(Ordering::SeqCst)
    }

    /// Sample all actuators concurrently.
    async fn collect(&self) -> SafetySnapshot {
        let states = join_all(self.actuators.iter().map(|handle| async move {
            match tokio::time::timeout(SAMPLE_TIMEOUT, handle.sample()).await {
                Ok(Ok(state)) => state,
                Ok(Err(error)) => {
                    warn!(actuator = handle.id(), %error, "sample failed; using last known state");
                    handle.state()
                }
                Err(_) => {
                    debug!(actuator = handle.id(), "sample timed out; using last known state");
                    handle.state()
                }
            }
        }))
        .await;

        let actuators = states
            .into_iter()
            .filter_map(|state| {
                self.table
                    .get(&state.actuator_id)
                    .map(|profile| ActuatorSample::new(profile, state))
            })
            .collect();
        SafetySnapshot {
            actuators,
            external_stop: self.external_stop(),
        }
    }

    /// Run one verification pass.  A violation engages the emergency stop
    /// and returns once every actuator has acknowledged the halt, even when
    /// the latch was already engaged.
    pub async fn check_once(&self) -> Result<(), SafetyViolation> {
        let snapshot = self.collect().await;
        self.latch.record_check(Utc::now());
        match self.verifier.verify(&snapshot) {
            Ok(()) => {
                trace!("safety check passed");
                Ok(())
            }
            Err(violation) => {
                if !self.latch.is_engaged() {
                    warn!(%violation, "safety violation");
                }
                self.emergency_stop(&violation.to_string()).await;
                Err(violation)
            }
        }
    }

    /// Engage the latch and command every actuator to rest.
    ///
    /// Calling this while already stopped re-issues the halt but changes
    /// neither the state nor its reason.
    pub async fn emergency_stop(&self, reason: &str) {
        if self.latch.engage(reason) {
            self.bus.emit(
                Topic::SafetyAlerts,
                SOURCE,
                EventPayload::Safety(self.latch.state()),
            );
            self.bus.emit(
                Topic::Diagnostics,
                SOURCE,
                EventPayload::Diagnostic(Diagnostic {
                    component: "safety-monitor".to_string(),
                    kind: DiagnosticKind::SafetyTrip,
                    message: reason.to_string(),
                }),
            );
        }

        let results = join_all(self.actuators.iter().map(|handle| handle.halt(reason))).await;
        for (handle, result) in self.actuators.iter().zip(results) {
            if let Err(error) = result {
                warn!(actuator = handle.id(), %error, "halt not acknowledged");
            }
        }
    }

    /// Clear the latch after re-validating the line.
    ///
    /// # Errors
    ///
    /// The first violation found, or [`SafetyViolation::ActuatorActive`]
    /// when an actuator has not returned to rest.  The latch stays engaged.
    pub async fn reset_emergency_stop(&self) -> Result<(), SafetyViolation> {
        let snapshot = self.collect().await;
        self.latch.record_check(Utc::now());

        let verdict = self.verifier.verify(&snapshot).and_then(|()| {
            match snapshot.actuators.iter().find(|s| s.state.is_active) {
                Some(active) => Err(SafetyViolation::ActuatorActive(
                    active.state.actuator_id.clone(),
                )),
                None => Ok(()),
            }
        });
        if let Err(violation) = verdict {
            warn!(%violation, "emergency stop reset refused");
            return Err(violation);
        }

        if self.latch.clear() {
            info!("line re-validated; emergency stop reset");
            self.bus.emit(
                Topic::SafetyAlerts,
                SOURCE,
                EventPayload::Safety(self.latch.state()),
            );
        }
        Ok(())
    }

    /// Check every `period` until `shutdown` flips to `true`.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "safety monitor started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let _ = self.check_once().await;
                }
            }
        }
        info!("safety monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator_task::{TaskContext, spawn_actuator};
    use crate::scheduler::DispatchStats;
    use sortline_hal::SimChannel;
    use sortline_hal::registry::driver_for;
    use sortline_types::{
        ActuatorProfile, DriveMode, DriverSettings, PositionRange, StepperSettings, TriggerEvent,
    };
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    fn stepper() -> ActuatorProfile {
        ActuatorProfile {
            id: "stepper1".to_string(),
            channel: 20,
            rest_position: 0.0,
            activation_position: 25.0,
            activation_duration: Duration::from_millis(300),
            min_interval: Duration::from_millis(500),
            safe_range: PositionRange::new(0.0, 50.0),
            drive_mode: DriveMode::Relative,
            category: None,
            max_temperature_c: 65.0,
            confirm_timeout: Duration::from_millis(50),
            confirm_tolerance: 0.5,
            driver: DriverSettings::Stepper(StepperSettings::default()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn violation_waits_for_rest_when_already_latched() {
        let profile = stepper();
        let table = Arc::new(ActuatorTable::new(vec![profile.clone()], Some("stepper1")).unwrap());
        let (channel, probe) = SimChannel::for_profile(&profile);
        let latch = SafetyLatch::new();
        let bus = EventBus::default();
        let ctx = TaskContext {
            latch: latch.clone(),
            stats: Arc::new(DispatchStats::new()),
            bus: bus.clone(),
            queue_capacity: 4,
        };
        let driver = driver_for(&profile, Box::new(channel));
        let (handle, _task) = spawn_actuator(profile, driver, ctx);
        let monitor = SafetyMonitor::new(
            vec![handle.clone()],
            table,
            latch.clone(),
            SafetyVerifier::with_default_rules(),
            bus,
        );

        let (reply, admitted) = oneshot::channel();
        handle
            .try_trigger(TriggerEvent::sensor(Instant::now()), Some(reply))
            .unwrap();
        assert!(admitted.await.unwrap().is_admitted());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.state().is_active);

        // Latched by another caller that has not waited for the halt.
        assert!(latch.engage("tripped elsewhere"));
        monitor.set_external_stop(true);
        assert!(matches!(
            monitor.check_once().await,
            Err(SafetyViolation::ExternalStop)
        ));

        let state = handle.state();
        assert!(!state.is_active);
        assert!(state.current_position.abs() < 0.5);
        assert_eq!(probe.position_raw(), 0);
        assert_eq!(latch.state().reason.as_deref(), Some("tripped elsewhere"));
    }
}
