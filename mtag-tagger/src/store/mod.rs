//! Item status persistence
//!
//! The scheduler, retry path and poller record status transitions through
//! `ItemStore`. Writes are advisory from the scheduler's point of view: a
//! failed write is logged and processing continues.

mod memory;
mod sqlite;

pub use memory::MemoryItemStore;
pub use sqlite::{init_database_pool, SqliteItemStore};

use async_trait::async_trait;
use mtag_common::Result;

use crate::types::{AsyncJob, ItemStatus};

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or reset an item as `pending`, dropping any job links
    async fn register(&self, item_id: &str, payload_ref: &str) -> Result<()>;

    /// Set the status of several items
    async fn set_status(&self, item_ids: &[String], status: ItemStatus) -> Result<()>;

    /// Mark one item `tagged` with its tags
    async fn mark_tagged(&self, item_id: &str, tags: &[String]) -> Result<()>;

    /// Link items to an asynchronous job
    ///
    /// An item may be linked to several jobs when one batch came back with
    /// more than one job id.
    async fn record_job(&self, item_ids: &[String], job_id: &str) -> Result<()>;

    /// Items still `pending` with at least one job link, grouped by job
    async fn pending_jobs(&self) -> Result<Vec<AsyncJob>>;

    /// Drop every link to a completed job
    ///
    /// Pending items left without any job link become `tagged`; their ids
    /// are returned. Items another job still covers stay `pending`.
    async fn complete_job(&self, job_id: &str) -> Result<Vec<String>>;

    /// Drop every link to a job that vanished or was given up on, leaving
    /// item status untouched
    async fn release_job(&self, job_id: &str) -> Result<()>;

    /// Current status of an item, if known
    async fn status(&self, item_id: &str) -> Result<Option<ItemStatus>>;

    /// Tags recorded for an item, if known
    async fn tags(&self, item_id: &str) -> Result<Option<Vec<String>>>;
}

/// Group `(item_id, job_id)` rows into jobs, keeping first-seen order
pub(crate) fn group_jobs(rows: impl IntoIterator<Item = (String, String)>) -> Vec<AsyncJob> {
    let mut jobs: Vec<AsyncJob> = Vec::new();
    for (item_id, job_id) in rows {
        match jobs.iter_mut().find(|j| j.job_id == job_id) {
            Some(job) => job.origin_item_ids.push(item_id),
            None => jobs.push(AsyncJob {
                job_id,
                origin_item_ids: vec![item_id],
            }),
        }
    }
    jobs
}
