//! `sortline-middleware` – routing between the actuation core and its
//! external collaborators.
//!
//! # Modules
//!
//! - [`bus`] – topic-partitioned publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`sink`] – [`TelemetrySink`] implementations that accept snapshots
//!   without ever blocking the publisher.
//! - [`ingest`] – parses classification results from the inference service
//!   and forwards them to the scheduler's trigger queue.

pub mod bus;
pub mod ingest;
pub mod sink;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use ingest::{ClassificationIngest, IngestError};
pub use sink::{BusSink, ChannelSink, LogSink, SinkError, TelemetrySink};
