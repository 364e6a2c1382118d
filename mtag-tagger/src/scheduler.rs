//! Submission queue and batch scheduler
//!
//! Buffers tag requests and decides when and how they leave for the
//! inference service:
//! - `bulk_threshold` or more pending: everything goes as one bulk batch
//! - `normal_batch_size` or more pending: the oldest `normal_batch_size` go as a sync batch
//! - fewer: a deadline timer is armed, and whatever is left goes when it fires
//!
//! Only one batch is ever in flight. After a batch, a non-empty queue waits
//! out the inter-batch delay; an open rate-limit window holds every flush
//! until it closes and replaces that delay.
//!
//! An item id has at most one owner at a time: the queue, the in-flight
//! batch, a pending retry, or a tracked job. Enqueueing an id that already
//! has one attaches to it instead of scheduling the item again.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mtag_common::events::{EventBus, TagEvent};

use crate::config::{RetryConfig, SchedulerConfig};
use crate::error::{FailureReason, SubmitError, SubmitErrorKind};
use crate::invoker::{reconcile, SubmitResponse, TagService};
use crate::poller::CompletionPoller;
use crate::retry::{RetryController, RetryDecision};
use crate::store::ItemStore;
use crate::types::{
    AsyncJob, Batch, ItemStatus, SubmissionMode, TagHandle, TagRequest, TagUpdate, UpdateSender,
};

/// Point-in-time view of the queue, for the API and diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub flushing: bool,
    pub deadline_armed: bool,
    pub rate_limit_remaining_secs: Option<u64>,
    pub tracked_jobs: Vec<String>,
    pub batches_submitted: u64,
}

/// A cancelable one-shot timer owned by the queue state
struct ArmedTimer {
    generation: u64,
    fires_at: Instant,
    token: CancellationToken,
}

impl ArmedTimer {
    fn cancel(self) {
        self.token.cancel();
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TagRequest>,
    /// Items owned by the scheduler (queued, in flight, or waiting to be
    /// re-enqueued), with their shared update channel
    active: HashMap<String, UpdateSender>,
    flushing: bool,
    /// Flush deadline for a short queue
    deadline: Option<ArmedTimer>,
    /// The deadline fired while a flush was not possible
    deadline_expired: bool,
    /// Wake-up scheduled for when a gate (rate limit, inter-batch delay) opens
    wake: Option<ArmedTimer>,
    /// No flush before this instant (inter-batch delay)
    cooldown_until: Option<Instant>,
    evaluation_scheduled: bool,
    timer_generation: u64,
    batches_submitted: u64,
}

/// Outcome of claiming an item id for a new enqueue
enum Claim {
    /// Nobody owns the item; the caller schedules this request
    Fresh(TagRequest),
    /// The item is already being worked on; attach to its updates
    Owned(UpdateSender),
}

struct SchedulerInner {
    config: SchedulerConfig,
    service: Arc<dyn TagService>,
    store: Arc<dyn ItemStore>,
    retry: RetryController,
    poller: CompletionPoller,
    events: EventBus,
    state: Mutex<QueueState>,
}

/// The process-wide tagging scheduler; cheap to clone
#[derive(Clone)]
pub struct TagScheduler {
    inner: Arc<SchedulerInner>,
}

impl TagScheduler {
    pub fn new(
        service: Arc<dyn TagService>,
        store: Arc<dyn ItemStore>,
        poller: CompletionPoller,
        events: EventBus,
        scheduler_config: &SchedulerConfig,
        retry_config: &RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config: scheduler_config.clone(),
                service,
                store,
                retry: RetryController::new(retry_config),
                poller,
                events,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue one item for tagging
    ///
    /// The item is recorded as `pending` and the returned handle reports its
    /// progress. Flush evaluation happens shortly after, so a burst of
    /// enqueues is looked at once. If the item is already queued, in flight,
    /// waiting to retry or riding on a tracked job, the handle follows that
    /// work instead and `payload_ref` is ignored.
    pub async fn enqueue(&self, item_id: &str, payload_ref: &str) -> TagHandle {
        match self.inner.claim(item_id, payload_ref) {
            Claim::Owned(updates) => updates.attach(item_id),
            Claim::Fresh(request) => {
                let handle = request.observe();
                self.inner.register(item_id, payload_ref).await;
                self.inner.push(vec![request]);
                handle
            }
        }
    }

    /// Queue an item nobody will observe
    ///
    /// Returns the queue length after the append, or `None` when the item
    /// is already being worked on and nothing was queued.
    pub async fn enqueue_detached(&self, item_id: &str, payload_ref: &str) -> Option<usize> {
        match self.inner.claim(item_id, payload_ref) {
            Claim::Owned(_) => None,
            Claim::Fresh(request) => {
                self.inner.register(item_id, payload_ref).await;
                Some(self.inner.push(vec![request]))
            }
        }
    }

    /// Queue several items atomically, in order
    ///
    /// Repeated ids, and ids already being worked on, get a handle on the
    /// existing request.
    pub async fn enqueue_many(&self, items: &[(String, String)]) -> Vec<TagHandle> {
        let mut requests = Vec::with_capacity(items.len());
        let mut handles = Vec::with_capacity(items.len());
        for (item_id, payload_ref) in items {
            match self.inner.claim(item_id, payload_ref) {
                Claim::Owned(updates) => handles.push(updates.attach(item_id)),
                Claim::Fresh(request) => {
                    self.inner.register(item_id, payload_ref).await;
                    handles.push(request.observe());
                    requests.push(request);
                }
            }
        }
        if !requests.is_empty() {
            self.inner.push(requests);
        }
        handles
    }

    /// Drop every unflushed request
    ///
    /// Their handles observe abandonment; in-flight batches, retry timers
    /// and tracked jobs are unaffected. Returns the number dropped.
    pub fn clear_pending(&self) -> usize {
        let mut state = self.inner.state();
        let cleared: Vec<TagRequest> = state.pending.drain(..).collect();
        for request in &cleared {
            state.active.remove(&request.item_id);
        }
        let dropped = cleared.len();
        state.deadline_expired = false;
        if let Some(timer) = state.deadline.take() {
            timer.cancel();
        }
        if dropped > 0 {
            info!(dropped, "Pending tag requests cleared");
        }
        dropped
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.state().flushing
    }

    pub fn poller(&self) -> &CompletionPoller {
        &self.inner.poller
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let rate_limit_remaining_secs = self
            .inner
            .retry
            .rate_limit_remaining()
            .map(|d| d.as_secs_f64().ceil() as u64);
        let tracked_jobs = self.inner.poller.tracked_job_ids();

        let state = self.inner.state();
        QueueSnapshot {
            pending: state.pending.len(),
            flushing: state.flushing,
            deadline_armed: state.deadline.is_some(),
            rate_limit_remaining_secs,
            tracked_jobs,
            batches_submitted: state.batches_submitted,
        }
    }
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `item_id` unless something already has it
    ///
    /// Lock order is scheduler state, then poller state.
    fn claim(&self, item_id: &str, payload_ref: &str) -> Claim {
        let mut state = self.state();
        if let Some(updates) = state.active.get(item_id) {
            debug!(item_id = %item_id, "Item already scheduled, attaching");
            return Claim::Owned(updates.clone());
        }
        if let Some(updates) = self.poller.follow(item_id) {
            debug!(item_id = %item_id, "Item riding on a tracked job, attaching");
            return Claim::Owned(updates);
        }

        let request = TagRequest::detached(item_id, payload_ref);
        state
            .active
            .insert(item_id.to_string(), request.updates.clone());
        Claim::Fresh(request)
    }

    /// The item left the scheduler (tagged, failed, or cleared)
    fn release(&self, item_id: &str) {
        self.state().active.remove(item_id);
    }

    async fn register(&self, item_id: &str, payload_ref: &str) {
        if let Err(e) = self.store.register(item_id, payload_ref).await {
            warn!(item_id = %item_id, error = %e, "Failed to persist pending item");
        }
    }

    async fn persist_status(&self, item_ids: &[String], status: ItemStatus) {
        if let Err(e) = self.store.set_status(item_ids, status).await {
            warn!(
                items = item_ids.len(),
                status = status.as_str(),
                error = %e,
                "Failed to persist item status"
            );
        }
    }

    /// Append to the queue and schedule a flush evaluation; returns queue length
    fn push(self: &Arc<Self>, requests: Vec<TagRequest>) -> usize {
        let mut state = self.state();
        state.pending.extend(requests);
        let len = state.pending.len();

        if !state.evaluation_scheduled {
            state.evaluation_scheduled = true;
            let inner = self.clone();
            let settle = self.config.enqueue_settle();
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                inner.state().evaluation_scheduled = false;
                inner.evaluate();
            });
        }
        len
    }

    /// Flush a batch if the policy allows it right now
    fn evaluate(self: &Arc<Self>) {
        let batch = {
            let mut state = self.state();
            match self.next_batch(&mut state) {
                Some(batch) => {
                    state.flushing = true;
                    state.batches_submitted += 1;
                    batch
                }
                None => return,
            }
        };

        tokio::spawn(self.clone().run_batch(batch));
    }

    fn next_batch(self: &Arc<Self>, state: &mut QueueState) -> Option<Batch> {
        if state.flushing || state.pending.is_empty() {
            return None;
        }

        // The rate-limit wait replaces the inter-batch delay
        if let Some(wait) = self.retry.rate_limit_remaining() {
            debug!(wait_ms = wait.as_millis() as u64, "Flush deferred by rate limit");
            state.cooldown_until = None;
            self.arm_wake(state, wait);
            return None;
        }

        let now = Instant::now();
        if let Some(until) = state.cooldown_until {
            if now < until {
                debug!(
                    wait_ms = (until - now).as_millis() as u64,
                    "Flush deferred by inter-batch delay"
                );
                self.arm_wake(state, until - now);
                return None;
            }
            state.cooldown_until = None;
        }

        let pending = state.pending.len();
        let (mode, take) = if pending >= self.config.bulk_threshold {
            (SubmissionMode::Bulk, pending)
        } else if pending >= self.config.normal_batch_size {
            (SubmissionMode::Sync, self.config.normal_batch_size)
        } else if state.deadline_expired {
            (SubmissionMode::Sync, pending)
        } else {
            self.arm_deadline(state);
            return None;
        };

        state.deadline_expired = false;
        if let Some(timer) = state.deadline.take() {
            timer.cancel();
        }
        if let Some(timer) = state.wake.take() {
            timer.cancel();
        }

        let requests: Vec<TagRequest> = state.pending.drain(..take).collect();
        Some(Batch { mode, requests })
    }

    fn next_generation(state: &mut QueueState) -> u64 {
        state.timer_generation += 1;
        state.timer_generation
    }

    fn arm_deadline(self: &Arc<Self>, state: &mut QueueState) {
        if state.deadline.is_some() {
            return;
        }

        let delay = self.config.flush_deadline();
        let generation = Self::next_generation(state);
        let token = CancellationToken::new();
        state.deadline = Some(ArmedTimer {
            generation,
            fires_at: Instant::now() + delay,
            token: token.clone(),
        });
        debug!(delay_ms = delay.as_millis() as u64, "Flush deadline armed");

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.on_deadline(generation),
            }
        });
    }

    fn on_deadline(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state();
            match &state.deadline {
                Some(timer) if timer.generation == generation => {
                    state.deadline = None;
                    state.deadline_expired = true;
                }
                _ => return,
            }
        }
        debug!("Flush deadline reached");
        self.evaluate();
    }

    /// Make sure an evaluation runs once `wait` has passed
    fn arm_wake(self: &Arc<Self>, state: &mut QueueState, wait: Duration) {
        let fires_at = Instant::now() + wait;
        if let Some(existing) = &state.wake {
            if existing.fires_at <= fires_at {
                return;
            }
        }
        if let Some(old) = state.wake.take() {
            old.cancel();
        }

        let generation = Self::next_generation(state);
        let token = CancellationToken::new();
        state.wake = Some(ArmedTimer {
            generation,
            fires_at,
            token: token.clone(),
        });

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(fires_at) => {
                    {
                        let mut state = inner.state();
                        if state.wake.as_ref().map(|t| t.generation) == Some(generation) {
                            state.wake = None;
                        }
                    }
                    inner.evaluate();
                }
            }
        });
    }

    async fn run_batch(self: Arc<Self>, batch: Batch) {
        let mode = batch.mode;
        let item_count = batch.len();
        info!(batch_size = item_count, %mode, "Submitting tag batch");
        self.events.emit_lossy(TagEvent::BatchSubmitted {
            item_count,
            mode,
            timestamp: Utc::now(),
        });

        let assets = batch.assets();
        match self.service.submit(&assets, mode).await {
            Ok(response) => {
                self.retry.clear_rate_limit();
                self.handle_success(batch, response).await;
            }
            Err(err) => self.handle_failure(batch, err).await,
        }

        {
            let mut state = self.state();
            state.flushing = false;
            if !state.pending.is_empty() {
                state.cooldown_until = Some(Instant::now() + self.config.inter_batch_delay());
            }
        }
        self.evaluate();
    }

    async fn handle_success(self: &Arc<Self>, batch: Batch, response: SubmitResponse) {
        let outcome = reconcile(batch, response);

        for (request, tags) in outcome.tagged {
            self.tag(request, tags).await;
        }

        if outcome.job_ids.is_empty() {
            return;
        }

        if outcome.awaiting_jobs.is_empty() {
            for job_id in outcome.job_ids {
                self.poller.register(AsyncJob {
                    job_id,
                    origin_item_ids: Vec::new(),
                });
            }
            return;
        }

        let item_ids: Vec<String> = outcome
            .awaiting_jobs
            .iter()
            .map(|r| r.item_id.clone())
            .collect();
        // Persist before tracking so a fast completion finds the items
        for job_id in &outcome.job_ids {
            if let Err(e) = self.store.record_job(&item_ids, job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to persist job id");
            }
        }

        // Hand over under the queue lock: a concurrent enqueue finds the
        // items either here or on the poller
        let mut state = self.state();
        for item_id in &item_ids {
            state.active.remove(item_id);
        }
        self.poller.track_batch(outcome.job_ids, outcome.awaiting_jobs);
        drop(state);
    }

    async fn tag(&self, request: TagRequest, tags: Vec<String>) {
        if let Err(e) = self.store.mark_tagged(&request.item_id, &tags).await {
            warn!(item_id = %request.item_id, error = %e, "Failed to persist tags");
        }
        debug!(item_id = %request.item_id, tags = tags.len(), "Item tagged");
        self.events.emit_lossy(TagEvent::ItemTagged {
            item_id: request.item_id.clone(),
            tag_count: tags.len(),
            timestamp: Utc::now(),
        });
        self.release(&request.item_id);
        request.notify(TagUpdate::Tagged { tags });
    }

    async fn handle_failure(self: &Arc<Self>, batch: Batch, err: SubmitError) {
        warn!(
            batch_size = batch.len(),
            kind = err.kind.as_str(),
            error = %err.message,
            "Tag batch submission failed"
        );

        if let SubmitErrorKind::RateLimited { retry_after } = err.kind {
            self.handle_rate_limited(batch, retry_after).await;
            return;
        }

        for request in batch.requests {
            match self.retry.decide(&err.kind, request.retry_count) {
                RetryDecision::Fail(reason) => self.fail(request, reason).await,
                RetryDecision::Retry { delay, retry_count } => {
                    self.schedule_retry(request, delay, retry_count).await
                }
                RetryDecision::AcceptEmpty => self.tag(request, Vec::new()).await,
            }
        }
    }

    async fn fail(&self, request: TagRequest, reason: FailureReason) {
        self.persist_status(std::slice::from_ref(&request.item_id), ItemStatus::Failed)
            .await;
        info!(
            item_id = %request.item_id,
            %reason,
            retry_count = request.retry_count,
            "Item failed"
        );
        self.events.emit_lossy(TagEvent::ItemFailed {
            item_id: request.item_id.clone(),
            reason: reason.to_string(),
            resubmitting: false,
            timestamp: Utc::now(),
        });
        self.release(&request.item_id);
        request.notify(TagUpdate::Failed {
            reason,
            resubmitting: false,
        });
    }

    async fn schedule_retry(
        self: &Arc<Self>,
        request: TagRequest,
        delay: Duration,
        retry_count: u32,
    ) {
        // Status stays pending while the retry is outstanding
        self.persist_status(std::slice::from_ref(&request.item_id), ItemStatus::Pending)
            .await;
        info!(
            item_id = %request.item_id,
            retry_count,
            delay_secs = delay.as_secs(),
            "Scheduling tag retry"
        );
        self.events.emit_lossy(TagEvent::ItemRetrying {
            item_id: request.item_id.clone(),
            retry_count,
            delay_secs: delay.as_secs(),
            timestamp: Utc::now(),
        });
        request.notify(TagUpdate::Retrying { retry_count });

        let inner = self.clone();
        let request = request.next_attempt();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(
                item_id = %request.item_id,
                retry_count = request.retry_count,
                "Re-enqueueing retried item"
            );
            inner.push(vec![request]);
        });
    }

    async fn handle_rate_limited(self: &Arc<Self>, batch: Batch, retry_after: Option<Duration>) {
        let plan = self.retry.on_rate_limited(retry_after);
        let item_ids = batch.item_ids();

        self.events.emit_lossy(TagEvent::RateLimited {
            reset_after_secs: plan.reset_after.as_secs(),
            item_count: item_ids.len(),
            timestamp: Utc::now(),
        });

        // Fail visibly right away so nothing looks stuck
        self.persist_status(&item_ids, ItemStatus::Failed).await;
        for request in &batch.requests {
            self.events.emit_lossy(TagEvent::ItemFailed {
                item_id: request.item_id.clone(),
                reason: FailureReason::RateLimited.to_string(),
                resubmitting: true,
                timestamp: Utc::now(),
            });
            request.notify(TagUpdate::Failed {
                reason: FailureReason::RateLimited,
                resubmitting: true,
            });
        }

        info!(
            items = item_ids.len(),
            resubmit_after_secs = plan.resubmit_after.as_secs(),
            "Rate-limited batch scheduled for background resubmission"
        );

        let inner = self.clone();
        let requests = batch.requests;
        tokio::spawn(async move {
            tokio::time::sleep(plan.resubmit_after).await;
            inner.resubmit(requests).await;
        });
    }

    /// Background resubmission after a rate limit: back to `pending` with a
    /// fresh retry budget
    async fn resubmit(self: &Arc<Self>, requests: Vec<TagRequest>) {
        let item_ids: Vec<String> = requests.iter().map(|r| r.item_id.clone()).collect();
        self.persist_status(&item_ids, ItemStatus::Pending).await;

        let requests: Vec<TagRequest> = requests
            .into_iter()
            .map(|request| {
                self.events.emit_lossy(TagEvent::ItemRetrying {
                    item_id: request.item_id.clone(),
                    retry_count: 0,
                    delay_secs: 0,
                    timestamp: Utc::now(),
                });
                request.notify(TagUpdate::Retrying { retry_count: 0 });
                request.with_reset_retries()
            })
            .collect();

        info!(items = requests.len(), "Resubmitting rate-limited items");
        self.push(requests);
    }
}
