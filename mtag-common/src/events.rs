//! Event types for the mtag event system
//!
//! Provides the shared event definitions and the `EventBus` used by the
//! tagging scheduler, the completion poller and the SSE stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How a batch is submitted to the inference service.
///
/// Decided at flush time from the pending count, never carried over from
/// the previous batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Inline per-item results in the same response
    Sync,
    /// Large batch, expected to come back as asynchronous job identifiers
    Bulk,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMode::Sync => "sync",
            SubmissionMode::Bulk => "bulk",
        }
    }
}

impl std::fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// mtag event types
///
/// Events are broadcast via `EventBus` and serialized for SSE transmission.
/// Observers use them to refresh derived views; nothing in the scheduler
/// depends on an event being received.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TagEvent {
    /// A batch left the queue and was sent to the inference service
    BatchSubmitted {
        /// Number of items in the batch
        item_count: usize,
        /// Mode chosen at flush time
        mode: SubmissionMode,
        timestamp: DateTime<Utc>,
    },

    /// Inline tags were received for an item
    ItemTagged {
        item_id: String,
        tag_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// An item is being retried (persisted status stays `pending`)
    ItemRetrying {
        item_id: String,
        /// Retry count the item will carry when re-enqueued
        retry_count: u32,
        /// Delay before the item re-enters the queue
        delay_secs: u64,
        timestamp: DateTime<Utc>,
    },

    /// An item was marked `failed`
    ItemFailed {
        item_id: String,
        reason: String,
        /// True when a background resubmission is already scheduled
        resubmitting: bool,
        timestamp: DateTime<Utc>,
    },

    /// The inference service asked us to slow down
    RateLimited {
        /// Seconds until the global gate reopens
        reset_after_secs: u64,
        /// Items in the batch that hit the limit
        item_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// An asynchronous job is now tracked by the completion poller
    JobTracked {
        job_id: String,
        item_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// An asynchronous job finished on the remote side
    ///
    /// Emitted exactly once per completed job.
    JobCompleted {
        job_id: String,
        item_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// The poller gave up on a job after exhausting its attempt budget
    JobAbandoned {
        job_id: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
}

impl TagEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &str {
        match self {
            TagEvent::BatchSubmitted { .. } => "BatchSubmitted",
            TagEvent::ItemTagged { .. } => "ItemTagged",
            TagEvent::ItemRetrying { .. } => "ItemRetrying",
            TagEvent::ItemFailed { .. } => "ItemFailed",
            TagEvent::RateLimited { .. } => "RateLimited",
            TagEvent::JobTracked { .. } => "JobTracked",
            TagEvent::JobCompleted { .. } => "JobCompleted",
            TagEvent::JobAbandoned { .. } => "JobAbandoned",
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper over a tokio broadcast channel. Cloning the bus shares the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TagEvent>,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events before slow
    /// receivers lag
    ///
    /// # Examples
    ///
    /// ```
    /// use mtag_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<TagEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TagEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers (connected SSE clients included)
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
