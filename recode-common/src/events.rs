//! Batch event bus
//!
//! Progress and lifecycle events published by the pipeline and concurrency
//! components. The binary subscribes and renders them as log lines; any
//! future UI can subscribe to the same bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Batch lifecycle and progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchEvent {
    /// A batch run started
    BatchStarted {
        session_id: String,
        total_files: usize,
        timestamp: DateTime<Utc>,
    },

    /// One task reached a terminal state
    TaskFinished {
        file_path: String,
        status: String,
        saving_bytes: i64,
        retries: u32,
        timestamp: DateTime<Utc>,
    },

    /// The worker pool was resized
    ConcurrencyAdjusted {
        reason: String,
        old_workers: usize,
        new_workers: usize,
        timestamp: DateTime<Utc>,
    },

    /// Memory usage crossed the warning or critical threshold
    MemoryPressure {
        usage: f64,
        critical: bool,
        timestamp: DateTime<Utc>,
    },

    /// The batch finished (successfully or after an abort)
    BatchCompleted {
        session_id: String,
        completed: usize,
        failed: usize,
        skipped: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`BatchEvent`]
///
/// Thin wrapper over `tokio::sync::broadcast`; slow subscribers lose old
/// events rather than blocking publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus with no subscribers is not an error
    pub fn publish(&self, event: BatchEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
