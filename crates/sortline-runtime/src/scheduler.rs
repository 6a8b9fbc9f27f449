//! [`ActuationScheduler`] – routes trigger events to actuator tasks.
//!
//! A single consumer drains the bounded trigger queue.  For each event it
//! picks the actuator (by category, or the default actuator for
//! categoryless sensor pulses) and hands the event to that actuator's task
//! without waiting for it.  Admission itself happens inside the task, so a
//! slow or busy actuator never holds up routing for the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sortline_middleware::{EventBus, Topic};
use sortline_types::{
    ActuatorProfile, ActuatorTable, Admission, DispatchCounters, EventPayload, RejectReason,
    TriggerEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::actuator_task::ActuatorHandle;

const SOURCE: &str = "sortline-runtime::scheduler";

/// Lock-free admission counters shared by the scheduler and every actuator
/// task.
#[derive(Debug, Default)]
pub struct DispatchStats {
    admitted: AtomicU64,
    rejected: [AtomicU64; RejectReason::ALL.len()],
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: RejectReason) {
        self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy.  Reasons that never occurred are omitted.
    pub fn snapshot(&self) -> DispatchCounters {
        let mut counters = DispatchCounters {
            admitted: self.admitted.load(Ordering::Relaxed),
            ..Default::default()
        };
        for reason in RejectReason::ALL {
            let n = self.rejected[reason.index()].load(Ordering::Relaxed);
            if n > 0 {
                counters.rejected.insert(reason, n);
            }
        }
        counters
    }
}

pub struct ActuationScheduler {
    table: Arc<ActuatorTable>,
    actuators: HashMap<String, ActuatorHandle>,
    stats: Arc<DispatchStats>,
    bus: EventBus,
}

impl ActuationScheduler {
    pub fn new(
        table: Arc<ActuatorTable>,
        actuators: HashMap<String, ActuatorHandle>,
        stats: Arc<DispatchStats>,
        bus: EventBus,
    ) -> Self {
        Self {
            table,
            actuators,
            stats,
            bus,
        }
    }

    /// The actuator an event is meant for.
    ///
    /// Categorised events go to the actuator bound to that category.
    /// Categoryless events go to the default actuator, if one is configured.
    pub fn match_actuator(&self, event: &TriggerEvent) -> Option<&ActuatorProfile> {
        match event.category.as_deref() {
            Some(category) => self.table.for_category(category),
            None => self.table.default_actuator(),
        }
    }

    /// Hand `event` to its actuator task.
    ///
    /// The returned receiver resolves with the task's admission decision.
    /// Failures to route are counted and published here.
    ///
    /// # Errors
    ///
    /// [`RejectReason::NoMatchingActuator`] when nothing matches, and
    /// [`RejectReason::ActuatorBusy`] when the actuator's command queue is
    /// full.
    pub fn route(&self, event: TriggerEvent) -> Result<oneshot::Receiver<Admission>, RejectReason> {
        let (reply, ticket) = oneshot::channel();
        let routed = self
            .match_actuator(&event)
            .and_then(|profile| self.actuators.get(&profile.id))
            .ok_or(RejectReason::NoMatchingActuator)
            .and_then(|handle| {
                handle
                    .try_trigger(event.clone(), Some(reply))
                    .map(|()| handle.id().to_string())
            });

        match routed {
            Ok(actuator) => {
                debug!(%actuator, source = %event.source, "trigger routed");
                Ok(ticket)
            }
            Err(reason) => {
                self.stats.record_rejected(reason);
                let actuator_id = self.match_actuator(&event).map(|p| p.id.clone());
                debug!(
                    category = event.category.as_deref().unwrap_or("-"),
                    source = %event.source,
                    %reason,
                    "trigger not routed"
                );
                self.bus.emit(
                    Topic::Actuation,
                    SOURCE,
                    EventPayload::Rejection {
                        actuator_id,
                        reason,
                    },
                );
                Err(reason)
            }
        }
    }

    /// Drain `triggers` until the queue closes or `shutdown` flips to `true`.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<TriggerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(actuators = self.actuators.len(), "scheduler started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = triggers.recv() => match event {
                    Some(event) => {
                        // Admission is decided by the actuator task; the
                        // ticket is only of interest to direct callers.
                        let _ = self.route(event);
                    }
                    None => {
                        warn!("trigger queue closed");
                        break;
                    }
                },
            }
        }
        info!("scheduler stopped");
    }

    pub fn stats(&self) -> DispatchCounters {
        self.stats.snapshot()
    }

    pub fn actuator(&self, id: &str) -> Option<&ActuatorHandle> {
        self.actuators.get(id)
    }
}
