//! Completion poller for asynchronous tagging jobs
//!
//! Tracks job ids handed over by the scheduler plus any `pending` items with
//! a stored job link (so tracking survives a restart). Every interval it
//! checks all tracked jobs concurrently. The loop stops by itself once
//! nothing is left to track and starts again on the next registration.
//!
//! A batch answered with several job ids puts its items on every one of
//! them. An item only counts as done once no tracked job covers it anymore.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use mtag_common::events::{EventBus, TagEvent};

use crate::config::PollerConfig;
use crate::error::SubmitError;
use crate::invoker::{JobStatus, TagService};
use crate::store::ItemStore;
use crate::types::{AsyncJob, TagRequest, TagUpdate, UpdateSender};

#[derive(Debug)]
struct TrackedJob {
    job: AsyncJob,
    attempts: u32,
}

#[derive(Default)]
struct PollerState {
    tracked: HashMap<String, TrackedJob>,
    /// Update channels of items riding on tracked jobs, by item id
    waiters: HashMap<String, UpdateSender>,
    /// Jobs already resolved or abandoned; not re-adopted from the store
    retired: HashSet<String>,
    running: bool,
}

impl PollerState {
    /// Whether any tracked job still carries `item_id`
    fn covers(&self, item_id: &str) -> bool {
        self.tracked
            .values()
            .any(|t| t.job.origin_item_ids.iter().any(|id| id == item_id))
    }

    /// Items of a just-removed job that no other tracked job covers, with
    /// their waiters taken out
    fn resolve(&mut self, job: AsyncJob) -> (Vec<String>, Vec<UpdateSender>) {
        let resolved: Vec<String> = job
            .origin_item_ids
            .into_iter()
            .filter(|id| !self.covers(id))
            .collect();
        let waiters = resolved
            .iter()
            .filter_map(|id| self.waiters.remove(id))
            .collect();
        (resolved, waiters)
    }

    fn adopt(&mut self, job: AsyncJob) -> bool {
        if self.retired.contains(&job.job_id) {
            return false;
        }
        match self.tracked.get_mut(&job.job_id) {
            Some(existing) => {
                for id in job.origin_item_ids {
                    if !existing.job.origin_item_ids.contains(&id) {
                        existing.job.origin_item_ids.push(id);
                    }
                }
                false
            }
            None => {
                self.tracked
                    .insert(job.job_id.clone(), TrackedJob { job, attempts: 0 });
                true
            }
        }
    }
}

struct PollerInner {
    service: Arc<dyn TagService>,
    store: Arc<dyn ItemStore>,
    events: EventBus,
    interval: Duration,
    max_attempts: u32,
    state: Mutex<PollerState>,
}

/// Handle to the completion poller; cheap to clone
#[derive(Clone)]
pub struct CompletionPoller {
    inner: Arc<PollerInner>,
}

impl CompletionPoller {
    pub fn new(
        service: Arc<dyn TagService>,
        store: Arc<dyn ItemStore>,
        events: EventBus,
        config: &PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                service,
                store,
                events,
                interval: config.interval(),
                max_attempts: config.max_attempts.max(1),
                state: Mutex::new(PollerState::default()),
            }),
        }
    }

    /// Track a job with no attached item handles
    pub fn register(&self, job: AsyncJob) {
        self.track(vec![job], Vec::new());
    }

    /// Track the jobs returned for a batch
    ///
    /// `requests` are the items riding on them. Each receives a
    /// `JobCompleted` update once the last job covering it completes.
    pub fn track_batch(&self, job_ids: Vec<String>, requests: Vec<TagRequest>) {
        let item_ids: Vec<String> = requests.iter().map(|r| r.item_id.clone()).collect();
        let jobs = job_ids
            .into_iter()
            .map(|job_id| AsyncJob {
                job_id,
                origin_item_ids: item_ids.clone(),
            })
            .collect();
        self.track(jobs, requests);
    }

    fn track(&self, jobs: Vec<AsyncJob>, requests: Vec<TagRequest>) {
        let mut adopted = Vec::new();
        {
            let mut state = self.inner.state();
            for request in requests {
                state.waiters.insert(request.item_id, request.updates);
            }
            for job in jobs {
                // An explicit registration revives a retired id
                state.retired.remove(&job.job_id);
                if state.adopt(job.clone()) {
                    adopted.push(job);
                }
            }
        }

        for job in adopted {
            info!(
                job_id = %job.job_id,
                items = job.origin_item_ids.len(),
                "Tracking async job"
            );
            self.inner.events.emit_lossy(TagEvent::JobTracked {
                job_id: job.job_id,
                item_ids: job.origin_item_ids,
                timestamp: Utc::now(),
            });
        }

        self.ensure_running();
    }

    /// Shared update channel of an item riding on a tracked job
    ///
    /// `None` when no tracked job covers the item. Used to attach a new
    /// observer instead of queueing the item a second time.
    pub fn follow(&self, item_id: &str) -> Option<UpdateSender> {
        let mut state = self.inner.state();
        if !state.covers(item_id) {
            return None;
        }
        Some(
            state
                .waiters
                .entry(item_id.to_string())
                .or_default()
                .clone(),
        )
    }

    /// Adopt jobs of `pending` items from the store (startup recovery)
    ///
    /// Returns the number of newly tracked jobs.
    pub async fn recover(&self) -> mtag_common::Result<usize> {
        let adopted = self.inner.merge_persisted().await?;
        if adopted > 0 {
            info!(jobs = adopted, "Recovered async jobs from item store");
            self.ensure_running();
        }
        Ok(adopted)
    }

    /// Ids of currently tracked jobs
    pub fn tracked_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state().tracked.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    fn ensure_running(&self) {
        {
            let mut state = self.inner.state();
            if state.running || state.tracked.is_empty() {
                return;
            }
            state.running = true;
        }

        debug!(
            interval_ms = self.inner.interval.as_millis() as u64,
            "Starting completion poller"
        );
        tokio::spawn(self.inner.clone().run());
    }
}

impl PollerInner {
    fn state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.interval).await;

            if let Err(e) = self.merge_persisted().await {
                warn!(error = %e, "Failed to read pending jobs from item store");
            }

            let job_ids: Vec<String> = self.state().tracked.keys().cloned().collect();
            if !job_ids.is_empty() {
                // One independent check per job; a failing check does not
                // affect the others
                let checks = job_ids.into_iter().map(|job_id| {
                    let service = self.service.clone();
                    async move {
                        let result = service.check_status(&job_id).await;
                        (job_id, result)
                    }
                });

                for (job_id, result) in join_all(checks).await {
                    self.apply(job_id, result).await;
                }
            }

            if self.stop_if_idle().await {
                info!("Completion poller idle, stopping");
                break;
            }
        }
    }

    async fn apply(&self, job_id: String, result: Result<JobStatus, SubmitError>) {
        match result {
            Ok(JobStatus::Completed) => self.complete(job_id).await,
            Ok(JobStatus::NotFound) => {
                if self.retire(&job_id) {
                    debug!(job_id = %job_id, "Async job no longer exists, dropping");
                    self.release(&job_id).await;
                }
            }
            other => {
                let attempts = {
                    let mut state = self.state();
                    let Some(tracked) = state.tracked.get_mut(&job_id) else {
                        return;
                    };
                    tracked.attempts += 1;
                    tracked.attempts
                };

                match &other {
                    Ok(JobStatus::Pending { detail }) => debug!(
                        job_id = %job_id,
                        attempts,
                        detail = detail.as_deref().unwrap_or(""),
                        "Async job still pending"
                    ),
                    Err(e) => {
                        debug!(job_id = %job_id, attempts, error = %e, "Status check failed")
                    }
                    _ => {}
                }

                if attempts < self.max_attempts || !self.retire(&job_id) {
                    return;
                }
                warn!(job_id = %job_id, attempts, "Giving up on async job after max attempts");
                self.release(&job_id).await;
                self.events.emit_lossy(TagEvent::JobAbandoned {
                    job_id,
                    attempts,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Stop tracking a job without resolving its items
    ///
    /// Waiters of items no other job covers are dropped, so their handles
    /// observe abandonment.
    fn retire(&self, job_id: &str) -> bool {
        let mut state = self.state();
        let Some(tracked) = state.tracked.remove(job_id) else {
            return false;
        };
        state.retired.insert(job_id.to_string());
        state.resolve(tracked.job);
        true
    }

    async fn release(&self, job_id: &str) {
        if let Err(e) = self.store.release_job(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to drop job links");
        }
    }

    async fn complete(&self, job_id: String) {
        let (mut item_ids, waiters) = {
            let mut state = self.state();
            let Some(tracked) = state.tracked.remove(&job_id) else {
                return;
            };
            state.retired.insert(job_id.clone());
            state.resolve(tracked.job)
        };

        match self.store.complete_job(&job_id).await {
            Ok(stored) => {
                for id in stored {
                    if !item_ids.contains(&id) {
                        item_ids.push(id);
                    }
                }
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to persist job completion"),
        }

        info!(job_id = %job_id, items = item_ids.len(), "Async job completed");

        for waiter in waiters {
            waiter.send(TagUpdate::JobCompleted {
                job_id: job_id.clone(),
            });
        }

        self.events.emit_lossy(TagEvent::JobCompleted {
            job_id,
            item_ids,
            timestamp: Utc::now(),
        });
    }

    /// Pull jobs of `pending` items from the store; returns how many were new
    async fn merge_persisted(&self) -> mtag_common::Result<usize> {
        let persisted = self.store.pending_jobs().await?;
        let persisted_ids: HashSet<String> =
            persisted.iter().map(|j| j.job_id.clone()).collect();

        let mut state = self.state();
        // Retired ids only matter while the store still reports them
        state.retired.retain(|id| persisted_ids.contains(id));
        Ok(persisted
            .into_iter()
            .filter(|job| state.adopt(job.clone()))
            .count())
    }

    /// Stop when nothing is tracked and the store has nothing new to adopt
    async fn stop_if_idle(&self) -> bool {
        if !self.state().tracked.is_empty() {
            return false;
        }

        let adopted = match self.merge_persisted().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to read pending jobs from item store");
                0
            }
        };

        let mut state = self.state();
        if adopted == 0 && state.tracked.is_empty() {
            state.running = false;
            true
        } else {
            false
        }
    }
}
