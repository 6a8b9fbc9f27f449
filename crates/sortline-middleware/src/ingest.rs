//! Classification ingest.
//!
//! The inference service pushes one JSON [`ClassificationMessage`] per
//! detected item.  [`ClassificationIngest`] parses those messages and
//! forwards them to the scheduler's bounded trigger queue.  A full queue
//! drops the message: replaying a stale classification later would
//! desynchronise the actuator from the belt.

use sortline_types::{ClassificationMessage, TriggerEvent};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed classification message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("trigger queue is full")]
    QueueFull,
    #[error("trigger queue is closed")]
    Closed,
}

/// Forwards classification results into the trigger queue.
#[derive(Clone)]
pub struct ClassificationIngest {
    triggers: mpsc::Sender<TriggerEvent>,
}

impl ClassificationIngest {
    pub fn new(triggers: mpsc::Sender<TriggerEvent>) -> Self {
        Self { triggers }
    }

    /// Forward an already-decoded message.
    pub fn submit(&self, message: ClassificationMessage) -> Result<(), IngestError> {
        let event = message.into_trigger(Instant::now());
        self.triggers.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
        })
    }

    /// Decode one JSON line and forward it.
    pub fn submit_json(&self, line: &str) -> Result<(), IngestError> {
        let message: ClassificationMessage = serde_json::from_str(line)?;
        self.submit(message)
    }

    /// Read newline-delimited JSON messages from `reader` until EOF or until
    /// the trigger queue closes.
    ///
    /// Malformed lines and full-queue drops are logged and skipped.  Returns
    /// the number of messages forwarded.
    pub async fn forward_lines<R>(&self, reader: R) -> std::io::Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut forwarded = 0;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.submit_json(line) {
                Ok(()) => forwarded += 1,
                Err(IngestError::Closed) => break,
                Err(IngestError::QueueFull) => {
                    warn!("trigger queue full; classification dropped");
                }
                Err(e) => debug!(error = %e, "skipping classification line"),
            }
        }
        Ok(forwarded)
    }
}
