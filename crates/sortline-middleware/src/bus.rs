//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  A slow subscriber lags and loses the oldest messages; the
//! publisher never waits.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Periodic actuator/safety snapshots |
//! | [`Topic::Actuation`] | Admitted activations and admission rejections |
//! | [`Topic::Diagnostics`] | Degraded sensors and drivers, dropped triggers |
//! | [`Topic::SafetyAlerts`] | Emergency-stop latch changes |

use sortline_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Actuation,
    Diagnostics,
    SafetyAlerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    telemetry: broadcast::Sender<Event>,
    actuation: broadcast::Sender<Event>,
    diagnostics: broadcast::Sender<Event>,
    safety_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(capacity);
        let (actuation, _) = broadcast::channel(capacity);
        let (diagnostics, _) = broadcast::channel(capacity);
        let (safety_alerts, _) = broadcast::channel(capacity);
        Self {
            telemetry,
            actuation,
            diagnostics,
            safety_alerts,
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of receivers handed the event, or `None` when the
    /// topic currently has no subscribers.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Option<usize> {
        self.topic_sender(topic).send(event).ok()
    }

    /// Build an [`Event`] around `payload` and publish it to `topic`.
    ///
    /// Having no subscribers is a normal condition and is not reported.
    pub fn emit(&self, topic: Topic, source: &str, payload: EventPayload) -> usize {
        match self.publish_to(topic, Event::new(source, payload)) {
            Some(n) => n,
            None => {
                trace!(?topic, source, "no subscribers; event discarded");
                0
            }
        }
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Telemetry => &self.telemetry,
            Topic::Actuation => &self.actuation,
            Topic::Diagnostics => &self.diagnostics,
            Topic::SafetyAlerts => &self.safety_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
