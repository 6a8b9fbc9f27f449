//! End-to-end runs of the engine against simulated output channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sortline_hal::{HardwareRegistry, OutputSignal, SimProbe};
use sortline_kernel::{SafetyViolation, SensorConfig};
use sortline_middleware::{ChannelSink, EventBus, LogSink, TelemetrySink, Topic, TopicReceiver};
use sortline_runtime::{EngineConfig, EngineHandle, SortingEngine};
use sortline_types::{
    ActuatorProfile, ActuatorTable, Admission, DiagnosticKind, DriveMode, DriverSettings, EventPayload,
    PositionRange, RawEdge, RejectReason, ServoSettings, StepperSettings, TriggerEvent,
};
use tokio::time::Instant;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn servo(id: &str, channel: u8, duration_ms: u64, interval_ms: u64) -> ActuatorProfile {
    ActuatorProfile {
        id: id.to_string(),
        channel,
        rest_position: 0.0,
        activation_position: 90.0,
        activation_duration: ms(duration_ms),
        min_interval: ms(interval_ms),
        safe_range: PositionRange::new(0.0, 120.0),
        drive_mode: DriveMode::Absolute,
        category: Some(id.to_string()),
        max_temperature_c: 65.0,
        confirm_timeout: ms(50),
        confirm_tolerance: 2.0,
        driver: DriverSettings::Servo(ServoSettings {
            slew_ms_per_60deg: 0,
            ..ServoSettings::default()
        }),
    }
}

/// Servo with the stock 200 ms per 60° slew: 300 ms out to 90° and back.
fn slewing_servo(id: &str, channel: u8, duration_ms: u64, interval_ms: u64) -> ActuatorProfile {
    ActuatorProfile {
        driver: DriverSettings::Servo(ServoSettings::default()),
        ..servo(id, channel, duration_ms, interval_ms)
    }
}

fn stepper() -> ActuatorProfile {
    ActuatorProfile {
        id: "stepper1".to_string(),
        channel: 20,
        rest_position: 0.0,
        activation_position: 25.0,
        activation_duration: ms(300),
        min_interval: ms(500),
        safe_range: PositionRange::new(0.0, 50.0),
        drive_mode: DriveMode::Relative,
        category: None,
        max_temperature_c: 65.0,
        confirm_timeout: ms(50),
        confirm_tolerance: 0.5,
        driver: DriverSettings::Stepper(StepperSettings::default()),
    }
}

fn start_with(
    config: EngineConfig,
    profiles: Vec<ActuatorProfile>,
    default_actuator: Option<&str>,
    sink: Arc<dyn TelemetrySink>,
) -> (EngineHandle, HashMap<String, SimProbe>) {
    let table = ActuatorTable::new(profiles, default_actuator).unwrap();
    let (registry, probes) = HardwareRegistry::simulated(&table);
    let engine =
        SortingEngine::start(config, table, registry, sink, EventBus::default()).unwrap();
    (engine, probes)
}

fn start(
    profiles: Vec<ActuatorProfile>,
    default_actuator: Option<&str>,
) -> (EngineHandle, HashMap<String, SimProbe>) {
    start_with(
        EngineConfig::default(),
        profiles,
        default_actuator,
        Arc::new(LogSink),
    )
}

fn classification(category: &str) -> TriggerEvent {
    TriggerEvent::classification(category, 0.9, Instant::now())
}

fn drain(rx: &mut TopicReceiver) -> Vec<EventPayload> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event.payload);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn second_trigger_inside_min_interval_is_rejected() {
    let (engine, _) = start(vec![servo("apple", 12, 30, 150)], None);

    let first = engine.dispatch(classification("apple")).await.unwrap();
    assert!(first.is_admitted());

    tokio::time::sleep(ms(50)).await;
    let second = engine.dispatch(classification("apple")).await.unwrap();
    assert_eq!(second.reject_reason(), Some(RejectReason::IntervalNotElapsed));

    tokio::time::sleep(ms(200)).await;
    let third = engine.dispatch(classification("apple")).await.unwrap();
    assert!(third.is_admitted());

    let stats = engine.stats();
    assert_eq!(stats.admitted, 2);
    assert_eq!(stats.rejected(RejectReason::IntervalNotElapsed), 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trigger_during_activation_is_busy_or_duplicate() {
    let (engine, probes) = start(vec![servo("pear", 13, 400, 150)], Some("pear"));

    assert!(engine.dispatch(classification("pear")).await.unwrap().is_admitted());
    tokio::time::sleep(ms(100)).await;

    let busy = engine.dispatch(classification("pear")).await.unwrap();
    assert_eq!(busy.reject_reason(), Some(RejectReason::ActuatorBusy));

    let sensor = engine
        .dispatch(TriggerEvent::sensor(Instant::now()))
        .await
        .unwrap();
    assert_eq!(sensor.reject_reason(), Some(RejectReason::DuplicateSuppressed));

    tokio::time::sleep(ms(500)).await;
    let state = engine.actuator_state("pear").unwrap();
    assert!(!state.is_active);
    assert!(state.current_position.abs() < 0.5);
    assert_eq!(state.activation_count, 1);

    let probe = &probes["pear"];
    assert_eq!(probe.position_raw(), 1000);
    assert_eq!(probe.last_signal(), Some(OutputSignal::Release));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trigger_while_returning_to_rest_is_refused_on_arrival() {
    let (engine, _) = start(vec![slewing_servo("pear", 13, 400, 150)], Some("pear"));
    let t0 = Instant::now();
    assert!(engine.dispatch(classification("pear")).await.unwrap().is_admitted());

    // Still slewing out, but the dispatch is already published.
    tokio::time::sleep(ms(100)).await;
    let state = engine.actuator_state("pear").unwrap();
    assert!(state.is_active);
    assert_eq!(state.activation_count, 1);
    assert!(state.last_activation.is_some());
    let busy = engine.dispatch(classification("pear")).await.unwrap();
    assert_eq!(busy.reject_reason(), Some(RejectReason::ActuatorBusy));
    let sensor = engine
        .dispatch(TriggerEvent::sensor(Instant::now()))
        .await
        .unwrap();
    assert_eq!(sensor.reject_reason(), Some(RejectReason::DuplicateSuppressed));

    // The hold ends at 400 ms; the slew back lasts until 700 ms.
    tokio::time::sleep_until(t0 + ms(550)).await;
    assert!(engine.actuator_state("pear").unwrap().is_active);
    let asked = Instant::now();
    let late = engine.dispatch(classification("pear")).await.unwrap();
    assert_eq!(late.reject_reason(), Some(RejectReason::ActuatorBusy));
    assert!(asked.elapsed() < ms(1));

    tokio::time::sleep_until(t0 + ms(750)).await;
    let state = engine.actuator_state("pear").unwrap();
    assert!(!state.is_active);
    assert!(state.current_position.abs() < 0.5);
    assert_eq!(state.activation_count, 1);
    assert!(engine.dispatch(classification("pear")).await.unwrap().is_admitted());

    let stats = engine.stats();
    assert_eq!(stats.admitted, 2);
    assert_eq!(stats.rejected(RejectReason::ActuatorBusy), 2);
    assert_eq!(stats.rejected(RejectReason::DuplicateSuppressed), 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn admitted_starts_are_spaced_by_whole_cycles() {
    let (engine, _) = start(vec![slewing_servo("lemon", 14, 400, 150)], None);
    let t0 = Instant::now();
    let mut starts = Vec::new();
    while t0.elapsed() < Duration::from_secs(3) {
        match engine.dispatch(classification("lemon")).await.unwrap() {
            Admission::Admitted(request) => starts.push(request.scheduled_start),
            Admission::Rejected(reason) => assert!(matches!(
                reason,
                RejectReason::ActuatorBusy | RejectReason::IntervalNotElapsed
            )),
        }
        tokio::time::sleep(ms(50)).await;
    }

    assert!(starts.len() >= 3);
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= ms(150));
        // Out, hold and back: nothing starts before the servo is at rest.
        assert!(gap >= ms(700));
    }
    assert_eq!(engine.stats().admitted, starts.len() as u64);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn over_temperature_mid_activation_returns_stepper_to_rest() {
    let config = EngineConfig {
        safety_interval: ms(250),
        ..EngineConfig::default()
    };
    let (engine, probes) = start_with(
        config,
        vec![slewing_servo("apple", 12, 400, 150), stepper()],
        Some("stepper1"),
        Arc::new(LogSink),
    );
    let mut alerts = engine.bus().subscribe_to(Topic::SafetyAlerts);
    let t0 = Instant::now();
    assert!(engine.dispatch(TriggerEvent::sensor(t0)).await.unwrap().is_admitted());

    // 25 units at 10 steps/unit and 1500 Hz: out by ~167 ms, held to 300 ms.
    tokio::time::sleep_until(t0 + ms(200)).await;
    let state = engine.actuator_state("stepper1").unwrap();
    assert!(state.is_active);
    assert!((state.current_position - 25.0).abs() < 0.5);
    probes["stepper1"].set_temperature(70.0);

    // The 250 ms check trips the latch.
    tokio::time::sleep_until(t0 + ms(300)).await;
    let safety = engine.safety_state();
    assert!(safety.emergency_stopped);
    assert!(safety.reason.as_deref().unwrap().contains("stepper1"));
    let apple = engine.dispatch(classification("apple")).await.unwrap();
    assert_eq!(apple.reject_reason(), Some(RejectReason::EmergencyStopped));
    let sensor = engine
        .dispatch(TriggerEvent::sensor(Instant::now()))
        .await
        .unwrap();
    assert_eq!(sensor.reject_reason(), Some(RejectReason::EmergencyStopped));

    // At rest within one safety interval of the trip.
    tokio::time::sleep_until(t0 + ms(500)).await;
    let state = engine.actuator_state("stepper1").unwrap();
    assert!(!state.is_active);
    assert!(state.current_position.abs() < 0.5);
    assert_eq!(probes["stepper1"].position_raw(), 0);
    assert!(
        drain(&mut alerts)
            .iter()
            .any(|p| matches!(p, EventPayload::Safety(s) if s.emergency_stopped))
    );
    assert_eq!(engine.stats().rejected(RejectReason::EmergencyStopped), 2);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn over_temperature_latches_emergency_stop() {
    let (engine, probes) = start(vec![servo("apple", 12, 400, 150), stepper()], None);
    let mut alerts = engine.bus().subscribe_to(Topic::SafetyAlerts);

    probes["stepper1"].set_temperature(70.0);
    let violation = engine.check_safety().await.unwrap_err();
    assert!(matches!(
        violation,
        SafetyViolation::OverTemperature { ref actuator, .. } if actuator == "stepper1"
    ));

    let safety = engine.safety_state();
    assert!(safety.emergency_stopped);
    assert!(safety.reason.as_deref().unwrap().contains("stepper1"));
    assert!(safety.last_check.is_some());
    assert!(
        drain(&mut alerts)
            .iter()
            .any(|p| matches!(p, EventPayload::Safety(s) if s.emergency_stopped))
    );

    for state in engine.actuator_states() {
        assert!(!state.is_active);
        assert!(state.current_position.abs() < 0.5);
    }

    let rejected = engine.dispatch(classification("apple")).await.unwrap();
    assert_eq!(rejected.reject_reason(), Some(RejectReason::EmergencyStopped));

    // The cause going away does not release the latch.
    probes["stepper1"].set_temperature(30.0);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(engine.safety_state().emergency_stopped);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reset_is_refused_until_the_line_is_safe() {
    let (engine, probes) = start(vec![servo("apple", 12, 30, 150), stepper()], None);

    probes["stepper1"].set_temperature(70.0);
    let _ = engine.check_safety().await;
    assert!(engine.safety_state().emergency_stopped);

    assert!(matches!(
        engine.reset_emergency_stop().await,
        Err(SafetyViolation::OverTemperature { .. })
    ));
    assert!(engine.safety_state().emergency_stopped);

    probes["stepper1"].set_temperature(30.0);
    engine.reset_emergency_stop().await.unwrap();
    let safety = engine.safety_state();
    assert!(!safety.emergency_stopped);
    assert!(safety.reason.is_none());

    assert!(engine.dispatch(classification("apple")).await.unwrap().is_admitted());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_aborts_activation_and_returns_to_rest() {
    let (engine, probes) = start(vec![servo("pear", 13, 400, 150)], None);
    let t0 = Instant::now();

    assert!(engine.dispatch(classification("pear")).await.unwrap().is_admitted());
    tokio::time::sleep(ms(50)).await;
    engine.emergency_stop("operator").await;

    assert!(t0.elapsed() < ms(400));
    let state = engine.actuator_state("pear").unwrap();
    assert!(!state.is_active);
    assert!(state.current_position.abs() < 0.5);
    assert_eq!(probes["pear"].position_raw(), 1000);

    // Idempotent: the first reason is kept.
    engine.emergency_stop("second press").await;
    assert_eq!(engine.safety_state().reason.as_deref(), Some("operator"));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn external_stop_input_trips_immediately() {
    let (engine, _) = start(vec![servo("apple", 12, 30, 150)], None);
    engine.set_external_stop(true).await;
    assert!(engine.safety_state().emergency_stopped);

    engine.set_external_stop(false).await;
    assert!(engine.safety_state().emergency_stopped);
    engine.reset_emergency_stop().await.unwrap();
    assert!(!engine.safety_state().emergency_stopped);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn confirmation_failure_degrades_actuator() {
    let (engine, probes) = start(vec![servo("lemon", 14, 400, 150)], None);
    let mut diagnostics = engine.bus().subscribe_to(Topic::Diagnostics);
    let probe = &probes["lemon"];
    probe.fail_confirmation(true);

    assert!(engine.dispatch(classification("lemon")).await.unwrap().is_admitted());
    tokio::time::sleep(ms(100)).await;

    let state = engine.actuator_state("lemon").unwrap();
    assert!(state.degraded);
    assert!(!state.is_active);
    let faults: Vec<_> = drain(&mut diagnostics)
        .into_iter()
        .filter(|p| matches!(p, EventPayload::Diagnostic(d) if d.kind == DiagnosticKind::DriverFault))
        .collect();
    assert_eq!(faults.len(), 1);

    tokio::time::sleep(ms(200)).await;
    let rejected = engine.dispatch(classification("lemon")).await.unwrap();
    assert_eq!(rejected.reject_reason(), Some(RejectReason::ActuatorDegraded));

    probe.fail_confirmation(false);
    assert!(engine.clear_degraded("lemon").await.unwrap());
    assert!(!engine.clear_degraded("lemon").await.unwrap());
    assert!(engine.dispatch(classification("lemon")).await.unwrap().is_admitted());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unmatched_events_are_counted() {
    let (engine, _) = start(vec![servo("apple", 12, 30, 150)], None);

    let banana = engine.dispatch(classification("banana")).await.unwrap();
    assert_eq!(banana.reject_reason(), Some(RejectReason::NoMatchingActuator));
    let pulse = engine
        .dispatch(TriggerEvent::sensor(Instant::now()))
        .await
        .unwrap();
    assert_eq!(pulse.reject_reason(), Some(RejectReason::NoMatchingActuator));

    assert_eq!(engine.stats().rejected(RejectReason::NoMatchingActuator), 2);
    assert!(matches!(
        engine.clear_degraded("banana").await,
        Err(sortline_types::SorterError::UnknownActuator(_))
    ));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bouncing_sensor_edges_trigger_once() {
    let config = EngineConfig {
        sensors: vec![SensorConfig {
            channel: 17,
            active_level: true,
            cooldown: ms(100),
            watchdog: Duration::from_secs(5),
        }],
        ..EngineConfig::default()
    };
    let (engine, _) = start_with(config, vec![stepper()], Some("stepper1"), Arc::new(LogSink));

    let t0 = Instant::now();
    for (level, offset) in [(true, 0), (false, 2), (true, 4), (false, 40)] {
        engine
            .submit_edge(RawEdge {
                channel: 17,
                level,
                timestamp: t0 + ms(offset),
            })
            .unwrap();
    }
    tokio::time::sleep(ms(20)).await;

    let stats = engine.stats();
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.total_rejected(), 0);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_sensor_is_reported_while_belt_runs() {
    let config = EngineConfig {
        sensor_check_interval: ms(100),
        sensors: vec![SensorConfig {
            channel: 17,
            active_level: true,
            cooldown: ms(100),
            watchdog: Duration::from_secs(1),
        }],
        ..EngineConfig::default()
    };
    let (engine, _) = start_with(config, vec![stepper()], Some("stepper1"), Arc::new(LogSink));
    let mut diagnostics = engine.bus().subscribe_to(Topic::Diagnostics);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(drain(&mut diagnostics).is_empty());

    engine.set_belt_running(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let silent: Vec<_> = drain(&mut diagnostics)
        .into_iter()
        .filter(|p| matches!(p, EventPayload::Diagnostic(d) if d.kind == DiagnosticKind::SensorSilent))
        .collect();
    assert_eq!(silent.len(), 1);

    assert!(engine.clear_sensor_degraded(17).await.unwrap());
    assert!(!engine.clear_sensor_degraded(3).await.unwrap());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_trigger_queue_drops_and_reports() {
    let config = EngineConfig {
        trigger_queue_capacity: 1,
        ..EngineConfig::default()
    };
    let (engine, _) = start_with(config, vec![servo("apple", 12, 30, 150)], None, Arc::new(LogSink));
    let mut diagnostics = engine.bus().subscribe_to(Topic::Diagnostics);

    engine.submit_trigger(classification("apple")).unwrap();
    assert!(engine.submit_trigger(classification("apple")).is_err());
    assert!(drain(&mut diagnostics).iter().any(
        |p| matches!(p, EventPayload::Diagnostic(d) if d.kind == DiagnosticKind::TriggerQueueFull)
    ));

    tokio::time::sleep(ms(10)).await;
    assert_eq!(engine.stats().admitted, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn telemetry_is_published_periodically() {
    let config = EngineConfig {
        telemetry_interval: ms(100),
        ..EngineConfig::default()
    };
    let (sink, mut rx) = ChannelSink::new(16);
    let (engine, _) = start_with(
        config,
        vec![servo("apple", 12, 30, 150), stepper()],
        None,
        Arc::new(sink),
    );

    tokio::time::sleep(ms(250)).await;
    let snapshot = rx.try_recv().unwrap();
    assert_eq!(snapshot.actuators.len(), 2);
    assert_eq!(snapshot.actuators[0].actuator_id, "apple");
    assert!(!snapshot.safety.emergency_stopped);
    assert_eq!(snapshot.dropped_snapshots, 0);
    assert!(rx.try_recv().is_ok());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_activation_returns_to_rest() {
    let (engine, probes) = start(vec![servo("pear", 13, 400, 150)], None);
    assert!(engine.dispatch(classification("pear")).await.unwrap().is_admitted());
    tokio::time::sleep(ms(50)).await;

    engine.shutdown().await;
    assert_eq!(probes["pear"].position_raw(), 1000);
    assert_eq!(probes["pear"].last_signal(), Some(OutputSignal::Release));
}
