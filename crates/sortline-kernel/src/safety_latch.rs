//! [`SafetyLatch`] – the process-wide, latched emergency-stop state.
//!
//! Backed by a [`tokio::sync::watch`] channel: readers see the current value
//! without locking out the writer, and in-flight activations can await
//! [`watch::Receiver::changed`] to abort the moment the latch engages.
//! Once engaged the latch stays engaged until [`SafetyLatch::clear`]; the
//! condition that tripped it going away changes nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sortline_types::SafetyState;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct SafetyLatch {
    tx: Arc<watch::Sender<SafetyState>>,
}

impl SafetyLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SafetyState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Engage the latch with `reason`.
    ///
    /// Engaging an engaged latch leaves the state untouched, including the
    /// original reason.  Returns `true` only for the call that engaged it.
    pub fn engage(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let engaged = self.tx.send_if_modified(|state| {
            if state.emergency_stopped {
                return false;
            }
            state.emergency_stopped = true;
            state.reason = Some(reason.clone());
            true
        });
        if engaged {
            error!(%reason, "emergency stop engaged");
        }
        engaged
    }

    pub fn is_engaged(&self) -> bool {
        self.tx.borrow().emergency_stopped
    }

    pub fn state(&self) -> SafetyState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SafetyState> {
        self.tx.subscribe()
    }

    /// Stamp the time of the latest safety check.  Subscribers are not woken.
    pub fn record_check(&self, at: DateTime<Utc>) {
        self.tx.send_if_modified(|state| {
            state.last_check = Some(at);
            false
        });
    }

    /// Release the latch.  Callers must have re-validated the line first.
    ///
    /// Returns `false` when the latch was not engaged.
    pub fn clear(&self) -> bool {
        let cleared = self.tx.send_if_modified(|state| {
            if !state.emergency_stopped {
                return false;
            }
            state.emergency_stopped = false;
            state.reason = None;
            true
        });
        if cleared {
            info!("emergency stop cleared");
        }
        cleared
    }
}

impl Default for SafetyLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_is_idempotent() {
        let latch = SafetyLatch::new();
        assert!(latch.engage("over temperature on stepper1"));
        let once = latch.state();
        assert!(!latch.engage("operator"));
        assert!(!latch.engage("operator"));
        assert_eq!(latch.state(), once);
        assert_eq!(once.reason.as_deref(), Some("over temperature on stepper1"));
    }

    #[test]
    fn latch_holds_until_cleared() {
        let latch = SafetyLatch::new();
        assert!(!latch.is_engaged());
        latch.engage("external stop");
        latch.record_check(Utc::now());
        assert!(latch.is_engaged());
        assert!(latch.clear());
        assert!(!latch.is_engaged());
        assert!(latch.state().reason.is_none());
        assert!(latch.state().last_check.is_some());
        assert!(!latch.clear());
    }

    #[tokio::test]
    async fn subscribers_are_woken_by_engage_not_by_checks() {
        let latch = SafetyLatch::new();
        let mut rx = latch.subscribe();
        latch.record_check(Utc::now());
        assert!(!rx.has_changed().unwrap());

        let clone = latch.clone();
        clone.engage("operator");
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().emergency_stopped);
    }
}
