//! Core item types shared by the scheduler, retry controller and poller

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::error::FailureReason;
pub use mtag_common::events::SubmissionMode;

/// Persisted tagging status of an item
///
/// Only `pending` ever loops; `tagged` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Failed,
    Tagged,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Failed => "failed",
            ItemStatus::Tagged => "tagged",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = mtag_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "failed" => Ok(ItemStatus::Failed),
            "tagged" => Ok(ItemStatus::Tagged),
            other => Err(mtag_common::Error::InvalidInput(format!(
                "Unknown item status: {}",
                other
            ))),
        }
    }
}

/// Progress notification delivered to whoever enqueued an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagUpdate {
    /// A retry was scheduled; the item is still being worked on
    Retrying { retry_count: u32 },
    /// Inline tags arrived
    Tagged { tags: Vec<String> },
    /// The asynchronous job carrying this item completed remotely
    JobCompleted { job_id: String },
    /// The item was marked `failed`
    ///
    /// With `resubmitting` set, a background resubmission is already
    /// scheduled and more updates will follow.
    Failed {
        reason: FailureReason,
        resubmitting: bool,
    },
}

impl TagUpdate {
    /// True when no further updates are expected for the item
    pub fn is_final(&self) -> bool {
        match self {
            TagUpdate::Retrying { .. } => false,
            TagUpdate::Tagged { .. } | TagUpdate::JobCompleted { .. } => true,
            TagUpdate::Failed { resubmitting, .. } => !resubmitting,
        }
    }
}

/// Sending side of an item's updates
///
/// Clones share one subscriber list, so a caller enqueueing an item that is
/// already scheduled can attach to the existing request. Sends never fail
/// loudly: a caller that dropped its handle simply stops receiving updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateSender {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<TagUpdate>>>>,
}

impl UpdateSender {
    /// A sender with no subscriber yet
    pub fn detached() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<TagUpdate>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber and hand back its receiving side
    pub fn attach(&self, item_id: &str) -> TagHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        TagHandle {
            item_id: item_id.to_string(),
            rx,
        }
    }

    pub fn send(&self, update: TagUpdate) {
        self.subscribers().retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// Receiving half handed back by `enqueue`
#[derive(Debug)]
pub struct TagHandle {
    item_id: String,
    rx: mpsc::UnboundedReceiver<TagUpdate>,
}

impl TagHandle {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Next update, or `None` once the item has been dropped by every owner
    pub async fn next(&mut self) -> Option<TagUpdate> {
        self.rx.recv().await
    }

    /// Wait for the final update
    ///
    /// `None` means the item was abandoned: the queue was cleared, its job
    /// vanished remotely, or polling gave up.
    pub async fn finished(mut self) -> Option<TagUpdate> {
        while let Some(update) = self.rx.recv().await {
            if update.is_final() {
                return Some(update);
            }
        }
        None
    }
}

/// A request to tag one item
///
/// Owned by the scheduler while queued, by a `Batch` while in flight, and by
/// the retry path while waiting for its resubmission delay.
#[derive(Debug)]
pub struct TagRequest {
    pub item_id: String,
    pub payload_ref: String,
    pub retry_count: u32,
    pub(crate) updates: UpdateSender,
}

impl TagRequest {
    /// Create a request and the handle that observes it
    pub fn new(item_id: impl Into<String>, payload_ref: impl Into<String>) -> (Self, TagHandle) {
        let request = Self::detached(item_id, payload_ref);
        let handle = request.observe();
        (request, handle)
    }

    /// Create a request nobody observes
    pub fn detached(item_id: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            payload_ref: payload_ref.into(),
            retry_count: 0,
            updates: UpdateSender::detached(),
        }
    }

    /// Another handle on this request's updates
    pub fn observe(&self) -> TagHandle {
        self.updates.attach(&self.item_id)
    }

    pub(crate) fn notify(&self, update: TagUpdate) {
        self.updates.send(update);
    }

    /// The same request carrying the next retry count
    pub(crate) fn next_attempt(mut self) -> Self {
        self.retry_count += 1;
        self
    }

    /// The same request with its retry budget restored
    pub(crate) fn with_reset_retries(mut self) -> Self {
        self.retry_count = 0;
        self
    }
}

/// Ordered snapshot of requests flushed from the queue together
#[derive(Debug)]
pub struct Batch {
    pub mode: SubmissionMode,
    pub requests: Vec<TagRequest>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.requests.iter().map(|r| r.item_id.clone()).collect()
    }

    /// Outbound payload entries, in batch order
    pub fn assets(&self) -> Vec<AssetRef> {
        self.requests
            .iter()
            .map(|r| AssetRef {
                asset_id: r.item_id.clone(),
                image_url: r.payload_ref.clone(),
            })
            .collect()
    }
}

/// One entry of the submit request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub asset_id: String,
    pub image_url: String,
}

/// A remote job accepted for asynchronous processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncJob {
    pub job_id: String,
    pub origin_item_ids: Vec<String>,
}
