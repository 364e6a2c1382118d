//! Shared test fixtures: a scripted in-memory `TagService` and a scheduler
//! wired to it

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use mtag_common::events::EventBus;
use mtag_tagger::config::{PollerConfig, RetryConfig, SchedulerConfig};
use mtag_tagger::error::{SubmitError, SubmitErrorKind};
use mtag_tagger::invoker::{ItemTags, JobStatus, SubmitResponse, TagService};
use mtag_tagger::poller::CompletionPoller;
use mtag_tagger::scheduler::TagScheduler;
use mtag_tagger::store::MemoryItemStore;
use mtag_tagger::types::{AssetRef, SubmissionMode};

/// One recorded submit call
#[derive(Debug, Clone)]
pub struct SubmitCall {
    pub item_ids: Vec<String>,
    pub mode: SubmissionMode,
    pub at: Instant,
}

/// Fake inference service
///
/// Scripted responses are consumed in order; once the script runs out every
/// submit succeeds with one inline tag per asset (`tag-<id>`). Unknown jobs
/// report `Pending`.
#[derive(Default)]
pub struct ScriptedService {
    script: Mutex<VecDeque<Result<SubmitResponse, SubmitError>>>,
    calls: Mutex<Vec<SubmitCall>>,
    statuses: Mutex<HashMap<String, JobStatus>>,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: Result<SubmitResponse, SubmitError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_error(&self, kind: SubmitErrorKind) {
        self.push(Err(SubmitError::new(kind, "scripted failure")));
    }

    pub fn push_jobs(&self, job_ids: &[&str]) {
        self.push(Ok(SubmitResponse {
            results: Vec::new(),
            job_ids: job_ids.iter().map(|j| j.to_string()).collect(),
        }));
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.to_string(), status);
    }

    pub fn calls(&self) -> Vec<SubmitCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn inline_tags(asset_id: &str) -> Vec<String> {
    vec![format!("tag-{}", asset_id)]
}

#[async_trait]
impl TagService for ScriptedService {
    async fn submit(
        &self,
        assets: &[AssetRef],
        mode: SubmissionMode,
    ) -> Result<SubmitResponse, SubmitError> {
        self.calls.lock().unwrap().push(SubmitCall {
            item_ids: assets.iter().map(|a| a.asset_id.clone()).collect(),
            mode,
            at: Instant::now(),
        });

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }

        Ok(SubmitResponse {
            results: assets
                .iter()
                .map(|a| ItemTags {
                    asset_id: a.asset_id.clone(),
                    tags: inline_tags(&a.asset_id),
                })
                .collect(),
            job_ids: Vec::new(),
        })
    }

    async fn check_status(&self, job_id: &str) -> Result<JobStatus, SubmitError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or(JobStatus::Pending { detail: None }))
    }
}

/// Scheduler, store and event bus around a `ScriptedService`, default timings
pub struct Harness {
    pub service: Arc<ScriptedService>,
    pub store: Arc<MemoryItemStore>,
    pub events: EventBus,
    pub scheduler: TagScheduler,
}

pub fn harness() -> Harness {
    harness_with(SchedulerConfig::default(), RetryConfig::default())
}

pub fn harness_with(scheduler_config: SchedulerConfig, retry_config: RetryConfig) -> Harness {
    let service = ScriptedService::new();
    let store = Arc::new(MemoryItemStore::new());
    let events = EventBus::new(256);

    let poller = CompletionPoller::new(
        service.clone(),
        store.clone(),
        events.clone(),
        &PollerConfig::default(),
    );
    let scheduler = TagScheduler::new(
        service.clone(),
        store.clone(),
        poller,
        events.clone(),
        &scheduler_config,
        &retry_config,
    );

    Harness {
        service,
        store,
        events,
        scheduler,
    }
}

pub fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}
