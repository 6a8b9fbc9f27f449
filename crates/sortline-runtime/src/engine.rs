//! [`SortingEngine`] – wires the actuation core together and owns its tasks.
//!
//! Task layout after [`SortingEngine::start`]:
//!
//! ```text
//! edges ──► sensor task (debouncer + watchdog) ──┐
//!                                                ├──► trigger queue ──► scheduler ──► actuator task × N
//! classifications ───────────────────────────────┘                                       ▲
//!                                                   safety monitor ── halt / sample ─────┤
//!                                                   telemetry publisher ◄── watch ───────┘
//! ```
//!
//! Every task stops when [`EngineHandle::shutdown`] is called; actuator
//! tasks return to rest before exiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sortline_hal::HardwareRegistry;
use sortline_kernel::{SafetyLatch, SafetyVerifier, SafetyViolation, SensorConfig, SensorDebouncer};
use sortline_middleware::{ClassificationIngest, EventBus, TelemetrySink, Topic};
use sortline_types::{
    ActuatorState, ActuatorTable, Admission, ClassificationMessage, Diagnostic, DiagnosticKind,
    DispatchCounters, EventPayload, RawEdge, SafetyState, SorterError, TelemetrySnapshot,
    TriggerEvent,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::actuator_task::{ActuatorHandle, TaskContext, spawn_actuator};
use crate::publisher::TelemetryPublisher;
use crate::safety_monitor::SafetyMonitor;
use crate::scheduler::{ActuationScheduler, DispatchStats};

const SOURCE: &str = "sortline-runtime::engine";

const SENSOR_QUEUE_CAPACITY: usize = 256;

/// Runtime tunables.  Actuator behaviour lives in the
/// [`ActuatorTable`]; these only size queues and pace the periodic tasks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub trigger_queue_capacity: usize,
    /// Commands buffered per actuator before triggers are refused as busy.
    pub actuator_queue_capacity: usize,
    pub safety_interval: Duration,
    pub telemetry_interval: Duration,
    /// How often silent sensor channels are looked for.
    pub sensor_check_interval: Duration,
    pub sensors: Vec<SensorConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trigger_queue_capacity: 64,
            actuator_queue_capacity: 4,
            safety_interval: Duration::from_secs(1),
            telemetry_interval: Duration::from_secs(1),
            sensor_check_interval: Duration::from_millis(500),
            sensors: Vec::new(),
        }
    }
}

enum SensorCommand {
    Edge(RawEdge),
    Belt(bool),
    ClearDegraded {
        channel: u8,
        reply: oneshot::Sender<bool>,
    },
}

pub struct SortingEngine;

impl SortingEngine {
    /// Take one driver per configured actuator out of `registry` and spawn
    /// every task.  Must be called from inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SorterError::Config`] for an invalid sensor list and
    /// [`SorterError::UnknownActuator`] when `registry` has no driver for a
    /// configured actuator.
    pub fn start(
        config: EngineConfig,
        table: ActuatorTable,
        mut registry: HardwareRegistry,
        sink: Arc<dyn TelemetrySink>,
        bus: EventBus,
    ) -> Result<EngineHandle, SorterError> {
        let debouncer = SensorDebouncer::new(config.sensors.clone(), Instant::now())?;
        let table = Arc::new(table);
        let latch = SafetyLatch::new();
        let stats = Arc::new(DispatchStats::new());
        let ctx = TaskContext {
            latch: latch.clone(),
            stats: stats.clone(),
            bus: bus.clone(),
            queue_capacity: config.actuator_queue_capacity,
        };

        let mut tasks = Vec::new();
        let mut ordered = Vec::with_capacity(table.len());
        for profile in table.iter() {
            let driver = registry.take(&profile.id)?;
            let (handle, task) = spawn_actuator(profile.clone(), driver, ctx.clone());
            ordered.push(handle);
            tasks.push(task);
        }
        if !registry.is_empty() {
            warn!(unused = registry.len(), "drivers without a configured actuator were ignored");
        }
        let by_id: HashMap<String, ActuatorHandle> = ordered
            .iter()
            .map(|h| (h.id().to_string(), h.clone()))
            .collect();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_queue_capacity.max(1));
        let (sensor_tx, sensor_rx) = mpsc::channel(SENSOR_QUEUE_CAPACITY);

        let scheduler = Arc::new(ActuationScheduler::new(
            table.clone(),
            by_id,
            stats.clone(),
            bus.clone(),
        ));
        tasks.push(tokio::spawn(
            scheduler.clone().run(trigger_rx, shutdown_rx.clone()),
        ));

        let monitor = SafetyMonitor::new(
            ordered.clone(),
            table.clone(),
            latch.clone(),
            SafetyVerifier::with_default_rules(),
            bus.clone(),
        );
        tasks.push(tokio::spawn(
            monitor
                .clone()
                .run(config.safety_interval, shutdown_rx.clone()),
        ));

        let publisher = TelemetryPublisher::new(
            ordered.iter().map(ActuatorHandle::subscribe).collect(),
            latch,
            stats,
            sink,
        );
        tasks.push(tokio::spawn(
            publisher
                .clone()
                .run(config.telemetry_interval, shutdown_rx.clone()),
        ));

        tasks.push(tokio::spawn(sensor_loop(
            debouncer,
            sensor_rx,
            trigger_tx.clone(),
            bus.clone(),
            config.sensor_check_interval,
            shutdown_rx,
        )));

        info!(
            actuators = ordered.len(),
            sensors = config.sensors.len(),
            "sorting engine started"
        );

        Ok(EngineHandle {
            ingest: ClassificationIngest::new(trigger_tx.clone()),
            triggers: trigger_tx,
            sensors: sensor_tx,
            actuators: ordered,
            scheduler,
            monitor,
            publisher,
            bus,
            shutdown: Arc::new(shutdown_tx),
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }
}

/// Offer `event` to the trigger queue.  A full queue drops it.
fn enqueue(
    triggers: &mpsc::Sender<TriggerEvent>,
    bus: &EventBus,
    event: TriggerEvent,
) -> Result<(), SorterError> {
    match triggers.try_send(event) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(source = %event.source, "trigger queue full; event dropped");
            bus.emit(
                Topic::Diagnostics,
                SOURCE,
                EventPayload::Diagnostic(Diagnostic {
                    component: "trigger-queue".to_string(),
                    kind: DiagnosticKind::TriggerQueueFull,
                    message: format!("{} trigger dropped", event.source),
                }),
            );
            Err(SorterError::Channel("trigger queue full".to_string()))
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(SorterError::Channel("trigger queue closed".to_string()))
        }
    }
}

async fn sensor_loop(
    mut debouncer: SensorDebouncer,
    mut commands: mpsc::Receiver<SensorCommand>,
    triggers: mpsc::Sender<TriggerEvent>,
    bus: EventBus,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(SensorCommand::Edge(edge)) => {
                    if let Some(event) = debouncer.on_edge(edge) {
                        let _ = enqueue(&triggers, &bus, event);
                    }
                }
                Some(SensorCommand::Belt(running)) => {
                    info!(running, "belt state changed");
                    debouncer.set_belt_running(running, Instant::now());
                }
                Some(SensorCommand::ClearDegraded { channel, reply }) => {
                    let _ = reply.send(debouncer.clear_degraded(channel, Instant::now()));
                }
                None => break,
            },
            _ = ticker.tick() => {
                for channel in debouncer.check_watchdog(Instant::now()) {
                    bus.emit(
                        Topic::Diagnostics,
                        SOURCE,
                        EventPayload::Diagnostic(Diagnostic {
                            component: format!("sensor:{channel}"),
                            kind: DiagnosticKind::SensorSilent,
                            message: format!("no edges on channel {channel} while the belt is running"),
                        }),
                    );
                }
            }
        }
    }
}

/// Cloneable control surface of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    triggers: mpsc::Sender<TriggerEvent>,
    sensors: mpsc::Sender<SensorCommand>,
    ingest: ClassificationIngest,
    actuators: Vec<ActuatorHandle>,
    scheduler: Arc<ActuationScheduler>,
    monitor: SafetyMonitor,
    publisher: TelemetryPublisher,
    bus: EventBus,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Queue a trigger for the scheduler without waiting.
    ///
    /// # Errors
    ///
    /// [`SorterError::Channel`] when the queue is full (the event is
    /// dropped) or closed.
    pub fn submit_trigger(&self, event: TriggerEvent) -> Result<(), SorterError> {
        enqueue(&self.triggers, &self.bus, event)
    }

    /// Queue a classification result, stamped with its arrival time.
    pub fn submit_classification(&self, message: ClassificationMessage) -> Result<(), SorterError> {
        self.submit_trigger(message.into_trigger(Instant::now()))
    }

    /// Feeder for line-oriented classification sources.
    pub fn classification_ingest(&self) -> ClassificationIngest {
        self.ingest.clone()
    }

    /// Hand a raw sensor edge to the debouncer.
    pub fn submit_edge(&self, edge: RawEdge) -> Result<(), SorterError> {
        self.sensors
            .try_send(SensorCommand::Edge(edge))
            .map_err(|_| SorterError::Channel("sensor queue unavailable".to_string()))
    }

    pub async fn set_belt_running(&self, running: bool) -> Result<(), SorterError> {
        self.sensors
            .send(SensorCommand::Belt(running))
            .await
            .map_err(|_| SorterError::Channel("sensor task stopped".to_string()))
    }

    /// Clear a silent sensor channel's degraded flag.  Returns `false` for
    /// an unconfigured channel.
    pub async fn clear_sensor_degraded(&self, channel: u8) -> Result<bool, SorterError> {
        let (reply, rx) = oneshot::channel();
        self.sensors
            .send(SensorCommand::ClearDegraded { channel, reply })
            .await
            .map_err(|_| SorterError::Channel("sensor task stopped".to_string()))?;
        rx.await
            .map_err(|_| SorterError::Channel("sensor task stopped".to_string()))
    }

    /// Route `event` directly and wait for the actuator's decision.
    pub async fn dispatch(&self, event: TriggerEvent) -> Result<Admission, SorterError> {
        match self.scheduler.route(event) {
            Ok(ticket) => ticket
                .await
                .map_err(|_| SorterError::Channel("actuator task stopped".to_string())),
            Err(reason) => Ok(Admission::Rejected(reason)),
        }
    }

    /// Latch the emergency stop and command every actuator to rest.
    pub async fn emergency_stop(&self, reason: &str) {
        self.monitor.emergency_stop(reason).await;
    }

    /// Clear the emergency stop after a fresh check passes.
    pub async fn reset_emergency_stop(&self) -> Result<(), SafetyViolation> {
        self.monitor.reset_emergency_stop().await
    }

    /// Run one safety check now.
    pub async fn check_safety(&self) -> Result<(), SafetyViolation> {
        self.monitor.check_once().await
    }

    /// Record the hardware emergency-stop input.  Asserting it is checked
    /// immediately.
    pub async fn set_external_stop(&self, asserted: bool) {
        self.monitor.set_external_stop(asserted);
        if asserted {
            let _ = self.monitor.check_once().await;
        }
    }

    /// Clear an actuator's degraded flag.  Returns whether it was set.
    pub async fn clear_degraded(&self, actuator: &str) -> Result<bool, SorterError> {
        self.scheduler
            .actuator(actuator)
            .ok_or_else(|| SorterError::UnknownActuator(actuator.to_string()))?
            .clear_degraded()
            .await
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.publisher.snapshot()
    }

    pub fn safety_state(&self) -> SafetyState {
        self.monitor.latch().state()
    }

    pub fn actuator_state(&self, actuator: &str) -> Option<ActuatorState> {
        self.scheduler.actuator(actuator).map(ActuatorHandle::state)
    }

    /// States of every actuator, in configuration order.
    pub fn actuator_states(&self) -> Vec<ActuatorState> {
        self.actuators.iter().map(ActuatorHandle::state).collect()
    }

    pub fn stats(&self) -> DispatchCounters {
        self.scheduler.stats()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Stop every task.  Actuators return to rest first.  Calling this
    /// twice is harmless.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        for handle in &self.actuators {
            if handle.shutdown().await.is_err() {
                warn!(actuator = handle.id(), "actuator task already stopped");
            }
        }
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("sorting engine stopped");
    }
}
