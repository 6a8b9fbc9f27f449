//! Per-actuator owning task.
//!
//! Each actuator's driver is moved into exactly one task, which is the only
//! code that ever touches that hardware channel or its [`ActuatorState`].
//! Everything else talks to it through an [`ActuatorHandle`]:
//!
//! - triggers are admitted here, against the safety latch as it reads at the
//!   moment of dispatch, so admission is atomic per actuator;
//! - from dispatch until the actuator is back at rest, the command queue is
//!   still served: triggers are rejected (busy or duplicate) on arrival and
//!   never wait for the cycle to end;
//! - the hold ends when the duration elapses, the latch engages, a halt or
//!   shutdown arrives, or every handle is dropped; in every case the
//!   actuator is commanded back to rest before the task moves on.
//!
//! The latest state is published on a [`watch`] channel for telemetry and
//! the safety monitor.  The dispatch bookkeeping is published before the
//! hardware starts moving.

use std::future::Future;
use std::sync::Arc;

use sortline_hal::ActuatorDriver;
use sortline_kernel::{AdmissionContext, AdmissionGate, SafetyLatch};
use sortline_middleware::{EventBus, Topic};
use sortline_types::{
    ActivationRequest, ActuatorProfile, ActuatorState, Admission, Diagnostic, DiagnosticKind,
    DriverError, EventPayload, RejectReason, SafetyState, SorterError, TriggerEvent,
    TriggerSource,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::scheduler::DispatchStats;

const SOURCE: &str = "sortline-runtime::actuator";

pub(crate) enum ActuatorCommand {
    Trigger {
        event: TriggerEvent,
        reply: Option<oneshot::Sender<Admission>>,
    },
    /// Abort any activation, stop, then rest.
    Halt {
        reason: String,
        done: oneshot::Sender<()>,
    },
    Sample {
        reply: oneshot::Sender<Result<ActuatorState, DriverError>>,
    },
    ClearDegraded {
        reply: oneshot::Sender<bool>,
    },
    /// Return to rest and exit.
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable handle onto one actuator task.
#[derive(Clone)]
pub struct ActuatorHandle {
    id: String,
    tx: mpsc::Sender<ActuatorCommand>,
    state: watch::Receiver<ActuatorState>,
}

impl ActuatorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Last published state.
    pub fn state(&self) -> ActuatorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ActuatorState> {
        self.state.clone()
    }

    /// Queue a trigger without waiting.  A full command queue means the
    /// actuator is busy; the trigger is dropped, not retried.
    pub(crate) fn try_trigger(
        &self,
        event: TriggerEvent,
        reply: Option<oneshot::Sender<Admission>>,
    ) -> Result<(), RejectReason> {
        match self.tx.try_send(ActuatorCommand::Trigger { event, reply }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RejectReason::ActuatorBusy),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(actuator = %self.id, "actuator task has stopped");
                Err(RejectReason::ActuatorDegraded)
            }
        }
    }

    /// Stop the actuator and command it to rest.  Resolves once it is there.
    pub async fn halt(&self, reason: &str) -> Result<(), SorterError> {
        let (done, rx) = oneshot::channel();
        self.send(ActuatorCommand::Halt {
            reason: reason.to_string(),
            done,
        })
        .await?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Read fresh feedback through the driver.
    pub async fn sample(&self) -> Result<ActuatorState, SorterError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActuatorCommand::Sample { reply }).await?;
        rx.await
            .map_err(|_| self.stopped())?
            .map_err(|source| SorterError::Driver {
                actuator: self.id.clone(),
                source,
            })
    }

    /// Clear the degraded flag.  Returns whether it was set.
    pub async fn clear_degraded(&self) -> Result<bool, SorterError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActuatorCommand::ClearDegraded { reply }).await?;
        rx.await.map_err(|_| self.stopped())
    }

    pub(crate) async fn shutdown(&self) -> Result<(), SorterError> {
        let (done, rx) = oneshot::channel();
        self.send(ActuatorCommand::Shutdown { done }).await?;
        rx.await.map_err(|_| self.stopped())
    }

    async fn send(&self, command: ActuatorCommand) -> Result<(), SorterError> {
        self.tx.send(command).await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> SorterError {
        SorterError::Channel(format!("actuator task '{}' has stopped", self.id))
    }
}

/// Shared collaborators of every actuator task.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub latch: SafetyLatch,
    pub stats: Arc<DispatchStats>,
    pub bus: EventBus,
    pub queue_capacity: usize,
}

/// Move `driver` into a new task and return its handle.
pub(crate) fn spawn_actuator(
    profile: ActuatorProfile,
    driver: Box<dyn ActuatorDriver>,
    ctx: TaskContext,
) -> (ActuatorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(ctx.queue_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(driver.current_state());
    let handle = ActuatorHandle {
        id: profile.id.clone(),
        tx,
        state: state_rx,
    };
    let task = ActuatorTask {
        driver,
        latch_rx: ctx.latch.subscribe(),
        desk: Desk {
            profile,
            gate: AdmissionGate::new(),
            latch: ctx.latch,
            rx,
            state_tx,
            stats: ctx.stats,
            bus: ctx.bus,
            deferred: Vec::new(),
        },
    };
    (handle, tokio::spawn(task.run()))
}

/// How a hold ended.
enum HoldEnd {
    Elapsed,
    Aborted,
}

/// Commands that need the driver, answered once it is back at rest.
enum Deferred {
    Halt(oneshot::Sender<()>),
    ClearDegraded(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
    Closed,
}

struct ActuatorTask {
    driver: Box<dyn ActuatorDriver>,
    latch_rx: watch::Receiver<SafetyState>,
    desk: Desk,
}

/// Everything but the driver, so the queue can be served while a motion
/// borrows it.
struct Desk {
    profile: ActuatorProfile,
    gate: AdmissionGate,
    latch: SafetyLatch,
    rx: mpsc::Receiver<ActuatorCommand>,
    state_tx: watch::Sender<ActuatorState>,
    stats: Arc<DispatchStats>,
    bus: EventBus,
    deferred: Vec<Deferred>,
}

/// Resolves once the latch is engaged.  Never resolves if the latch is gone.
async fn engaged(latch_rx: &mut watch::Receiver<SafetyState>) {
    let alive = latch_rx.wait_for(|s| s.emergency_stopped).await.is_ok();
    if !alive {
        std::future::pending::<()>().await;
    }
}

impl ActuatorTask {
    async fn run(mut self) {
        debug!(actuator = %self.desk.profile.id, "actuator task started");
        while let Some(command) = self.desk.rx.recv().await {
            let keep_running = match command {
                ActuatorCommand::Trigger { event, reply } => {
                    let state = self.driver.current_state();
                    let admission = self.desk.admit(&state, &event, None);
                    let request = match &admission {
                        Admission::Admitted(request) => Some(request.clone()),
                        Admission::Rejected(_) => None,
                    };
                    if let Some(reply) = reply {
                        let _ = reply.send(admission);
                    }
                    match request {
                        Some(request) => self.run_activation(request).await,
                        None => true,
                    }
                }
                ActuatorCommand::Halt { reason, done } => {
                    info!(actuator = %self.desk.profile.id, %reason, "halt");
                    self.desk.deferred.push(Deferred::Halt(done));
                    self.return_to_rest(None, true).await
                }
                ActuatorCommand::Sample { reply } => {
                    let sampled = self.sample().await;
                    let _ = reply.send(sampled);
                    true
                }
                ActuatorCommand::ClearDegraded { reply } => {
                    let _ = reply.send(self.clear_degraded());
                    true
                }
                ActuatorCommand::Shutdown { done } => {
                    let _ = done.send(());
                    false
                }
            };
            if !keep_running {
                break;
            }
        }
        debug!(actuator = %self.desk.profile.id, "actuator task stopped");
    }

    /// Drive one admitted activation to completion.  Returns `false` when the
    /// task must exit afterwards.
    async fn run_activation(&mut self, request: ActivationRequest) -> bool {
        let mut dispatched = self.driver.current_state();
        dispatched.record_dispatch(request.scheduled_start);
        self.desk.state_tx.send_replace(dispatched);

        let latch_rx = &mut self.latch_rx;
        let driver = &mut self.driver;
        let req = &request;
        let activation = async move {
            tokio::select! {
                biased;
                () = engaged(latch_rx) => None,
                result = driver.activate(req) => Some(result),
            }
        };
        let activated = self.desk.serve_while(activation, Some(request.source)).await;
        self.publish();

        let aborted = match activated {
            None => {
                warn!(actuator = %self.desk.profile.id, "activation aborted by emergency stop");
                true
            }
            Some(Err(error)) => {
                self.mark_degraded(&error);
                false
            }
            Some(Ok(())) if self.desk.interrupted() => true,
            Some(Ok(())) => matches!(self.hold(&request).await, HoldEnd::Aborted),
        };
        self.return_to_rest(Some(request.source), aborted).await
    }

    /// Hold the activation until its deadline, serving commands meanwhile.
    async fn hold(&mut self, request: &ActivationRequest) -> HoldEnd {
        let deadline = request.deadline();
        loop {
            tokio::select! {
                biased;
                () = engaged(&mut self.latch_rx) => {
                    warn!(actuator = %self.desk.profile.id, "activation aborted by emergency stop");
                    return HoldEnd::Aborted;
                }
                () = tokio::time::sleep_until(deadline) => return HoldEnd::Elapsed,
                command = self.desk.rx.recv() => match command {
                    Some(ActuatorCommand::Trigger { event, reply }) => {
                        let state = self.driver.current_state();
                        let admission = self.desk.admit(&state, &event, Some(request.source));
                        if let Some(reply) = reply {
                            let _ = reply.send(admission);
                        }
                    }
                    Some(ActuatorCommand::Halt { reason, done }) => {
                        info!(actuator = %self.desk.profile.id, %reason, "halt during activation");
                        self.desk.deferred.push(Deferred::Halt(done));
                        return HoldEnd::Aborted;
                    }
                    Some(ActuatorCommand::Sample { reply }) => {
                        let sampled = self.sample().await;
                        let _ = reply.send(sampled);
                    }
                    Some(ActuatorCommand::ClearDegraded { reply }) => {
                        let _ = reply.send(self.clear_degraded());
                    }
                    Some(ActuatorCommand::Shutdown { done }) => {
                        self.desk.deferred.push(Deferred::Shutdown(done));
                        return HoldEnd::Aborted;
                    }
                    None => {
                        self.desk.deferred.push(Deferred::Closed);
                        return HoldEnd::Aborted;
                    }
                },
            }
        }
    }

    /// Command rest, then release, then answer whatever was deferred.
    /// Runs regardless of how the activation ended.  Returns `false` when
    /// the task must exit.
    async fn return_to_rest(&mut self, in_flight: Option<TriggerSource>, stop_first: bool) -> bool {
        let rest = self.desk.profile.rest_position;
        let driver = &mut self.driver;
        let motion = async move {
            let mut faults = Vec::new();
            if stop_first && let Err(error) = driver.stop().await {
                faults.push(error);
            }
            if let Err(error) = driver.move_to(rest).await {
                faults.push(error);
            }
            if let Err(error) = driver.stop().await {
                faults.push(error);
            }
            faults
        };
        let faults = self.desk.serve_while(motion, in_flight).await;
        for error in &faults {
            self.mark_degraded(error);
        }
        debug!(actuator = %self.desk.profile.id, "at rest");
        self.publish();
        self.settle()
    }

    /// Answer the deferred commands.  Returns `false` when one of them ends
    /// the task.
    fn settle(&mut self) -> bool {
        let mut keep_running = true;
        for deferred in std::mem::take(&mut self.desk.deferred) {
            match deferred {
                Deferred::Halt(done) => {
                    let _ = done.send(());
                }
                Deferred::ClearDegraded(reply) => {
                    let _ = reply.send(self.clear_degraded());
                }
                Deferred::Shutdown(done) => {
                    let _ = done.send(());
                    keep_running = false;
                }
                Deferred::Closed => keep_running = false,
            }
        }
        keep_running
    }

    async fn sample(&mut self) -> Result<ActuatorState, DriverError> {
        let sampled = self.driver.sample().await;
        if let Err(error) = &sampled {
            warn!(actuator = %self.desk.profile.id, %error, "feedback sample failed");
        }
        self.publish();
        sampled
    }

    fn clear_degraded(&mut self) -> bool {
        let was = self.driver.current_state().degraded;
        self.driver.set_degraded(false);
        if was {
            info!(actuator = %self.desk.profile.id, "degraded flag cleared");
        }
        self.publish();
        was
    }

    fn mark_degraded(&mut self, error: &DriverError) {
        if !self.driver.current_state().degraded {
            warn!(actuator = %self.desk.profile.id, %error, "driver fault; actuator degraded");
            self.driver.set_degraded(true);
            self.desk.bus.emit(
                Topic::Diagnostics,
                SOURCE,
                EventPayload::Diagnostic(Diagnostic {
                    component: format!("actuator:{}", self.desk.profile.id),
                    kind: DiagnosticKind::DriverFault,
                    message: error.to_string(),
                }),
            );
        }
        self.publish();
    }

    fn publish(&self) {
        self.desk.state_tx.send_replace(self.driver.current_state());
    }
}

impl Desk {
    /// Run the ordered admission checks for `event` at this instant.
    fn admit(
        &self,
        state: &ActuatorState,
        event: &TriggerEvent,
        in_flight: Option<TriggerSource>,
    ) -> Admission {
        let ctx = AdmissionContext {
            profile: &self.profile,
            state,
            emergency_stopped: self.latch.is_engaged(),
            in_flight,
            source: event.source,
            now: Instant::now(),
        };
        let admission = self.gate.evaluate(&ctx);
        self.record(event, &admission);
        admission
    }

    /// Answer a trigger that arrived while the driver is moving.  Nothing is
    /// admitted mid-motion: a trigger the gate would pass is busy.
    fn refuse(&self, event: &TriggerEvent, in_flight: Option<TriggerSource>) -> Admission {
        let state = self.state_tx.borrow().clone();
        let ctx = AdmissionContext {
            profile: &self.profile,
            state: &state,
            emergency_stopped: self.latch.is_engaged(),
            in_flight,
            source: event.source,
            now: Instant::now(),
        };
        let admission = match self.gate.evaluate(&ctx) {
            Admission::Admitted(_) => Admission::Rejected(RejectReason::ActuatorBusy),
            rejected => rejected,
        };
        self.record(event, &admission);
        admission
    }

    fn record(&self, event: &TriggerEvent, admission: &Admission) {
        match admission {
            Admission::Admitted(request) => {
                self.stats.record_admitted();
                info!(
                    actuator = %self.profile.id,
                    source = %request.source,
                    target = request.target_position,
                    "activation admitted"
                );
                self.bus.emit(
                    Topic::Actuation,
                    SOURCE,
                    EventPayload::Activation {
                        actuator_id: self.profile.id.clone(),
                        target_position: request.target_position,
                        source: request.source,
                    },
                );
            }
            Admission::Rejected(reason) => {
                self.stats.record_rejected(*reason);
                debug!(actuator = %self.profile.id, source = %event.source, %reason, "trigger rejected");
                self.bus.emit(
                    Topic::Actuation,
                    SOURCE,
                    EventPayload::Rejection {
                        actuator_id: Some(self.profile.id.clone()),
                        reason: *reason,
                    },
                );
            }
        }
    }

    /// A halt, shutdown or closed queue is waiting for the actuator to rest.
    fn interrupted(&self) -> bool {
        self.deferred
            .iter()
            .any(|d| !matches!(d, Deferred::ClearDegraded(_)))
    }

    /// Await `motion` while serving the command queue.
    ///
    /// Triggers are refused on arrival and samples get the last published
    /// state.  Commands that need the driver are deferred until the
    /// actuator is back at rest.
    async fn serve_while<T>(
        &mut self,
        motion: impl Future<Output = T>,
        in_flight: Option<TriggerSource>,
    ) -> T {
        tokio::pin!(motion);
        let mut open = true;
        loop {
            tokio::select! {
                biased;
                output = &mut motion => return output,
                command = self.rx.recv(), if open => match command {
                    Some(ActuatorCommand::Trigger { event, reply }) => {
                        let admission = self.refuse(&event, in_flight);
                        if let Some(reply) = reply {
                            let _ = reply.send(admission);
                        }
                    }
                    Some(ActuatorCommand::Sample { reply }) => {
                        let _ = reply.send(Ok(self.state_tx.borrow().clone()));
                    }
                    Some(ActuatorCommand::Halt { reason, done }) => {
                        info!(actuator = %self.profile.id, %reason, "halt while moving");
                        self.deferred.push(Deferred::Halt(done));
                    }
                    Some(ActuatorCommand::ClearDegraded { reply }) => {
                        self.deferred.push(Deferred::ClearDegraded(reply));
                    }
                    Some(ActuatorCommand::Shutdown { done }) => {
                        self.deferred.push(Deferred::Shutdown(done));
                    }
                    None => {
                        open = false;
                        self.deferred.push(Deferred::Closed);
                    }
                },
            }
        }
    }
}
