//! In-memory item store, used when no database is wanted and in tests
//!
//! Payload references are not kept; nothing reads them back.

use async_trait::async_trait;
use mtag_common::Result;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{group_jobs, ItemStore};
use crate::types::{AsyncJob, ItemStatus};

#[derive(Debug, Clone)]
struct ItemRecord {
    status: ItemStatus,
    /// Jobs still covering the item
    job_ids: Vec<String>,
    tags: Vec<String>,
    /// Insertion sequence, so job grouping is deterministic
    seq: u64,
}

#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<BTreeMap<String, ItemRecord>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn register(&self, item_id: &str, _payload_ref: &str) -> Result<()> {
        let mut items = self.items.write().await;
        let seq = items.len() as u64;
        let record = items.entry(item_id.to_string()).or_insert_with(|| ItemRecord {
            status: ItemStatus::Pending,
            job_ids: Vec::new(),
            tags: Vec::new(),
            seq,
        });
        record.status = ItemStatus::Pending;
        record.job_ids.clear();
        Ok(())
    }

    async fn set_status(&self, item_ids: &[String], status: ItemStatus) -> Result<()> {
        let mut items = self.items.write().await;
        for id in item_ids {
            if let Some(record) = items.get_mut(id) {
                record.status = status;
            }
        }
        Ok(())
    }

    async fn mark_tagged(&self, item_id: &str, tags: &[String]) -> Result<()> {
        if let Some(record) = self.items.write().await.get_mut(item_id) {
            record.status = ItemStatus::Tagged;
            record.tags = tags.to_vec();
        }
        Ok(())
    }

    async fn record_job(&self, item_ids: &[String], job_id: &str) -> Result<()> {
        let mut items = self.items.write().await;
        for id in item_ids {
            if let Some(record) = items.get_mut(id) {
                if !record.job_ids.iter().any(|j| j == job_id) {
                    record.job_ids.push(job_id.to_string());
                }
            }
        }
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<AsyncJob>> {
        let items = self.items.read().await;
        let mut rows: Vec<_> = items
            .iter()
            .filter(|(_, r)| r.status == ItemStatus::Pending)
            .flat_map(|(id, r)| {
                r.job_ids
                    .iter()
                    .map(move |job| (r.seq, id.clone(), job.clone()))
            })
            .collect();
        rows.sort_by_key(|(seq, _, _)| *seq);
        Ok(group_jobs(rows.into_iter().map(|(_, id, job)| (id, job))))
    }

    async fn complete_job(&self, job_id: &str) -> Result<Vec<String>> {
        let mut items = self.items.write().await;
        let mut resolved = Vec::new();
        for (id, record) in items.iter_mut() {
            let before = record.job_ids.len();
            record.job_ids.retain(|j| j != job_id);
            if record.job_ids.len() == before || !record.job_ids.is_empty() {
                continue;
            }
            if record.status == ItemStatus::Pending {
                record.status = ItemStatus::Tagged;
                resolved.push(id.clone());
            }
        }
        Ok(resolved)
    }

    async fn release_job(&self, job_id: &str) -> Result<()> {
        for record in self.items.write().await.values_mut() {
            record.job_ids.retain(|j| j != job_id);
        }
        Ok(())
    }

    async fn status(&self, item_id: &str) -> Result<Option<ItemStatus>> {
        Ok(self.items.read().await.get(item_id).map(|r| r.status))
    }

    async fn tags(&self, item_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self.items.read().await.get(item_id).map(|r| r.tags.clone()))
    }
}
