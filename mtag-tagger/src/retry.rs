//! Retry / backoff controller
//!
//! Decides what happens to items of a failed batch and owns the global
//! rate-limit gate consulted before every flush. The controller only decides;
//! the scheduler carries the decisions out (status writes, notifications,
//! timers).

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::error::{FailureReason, SubmitErrorKind};

/// Outcome for one item of a failed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Terminal: mark `failed` and notify
    Fail(FailureReason),
    /// Keep `pending`, signal retry start now, re-enqueue after `delay`
    Retry { delay: Duration, retry_count: u32 },
    /// Treat as a success with an empty tag set
    AcceptEmpty,
}

/// What to do with a rate-limited batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPlan {
    /// How long the global gate stays closed
    pub reset_after: Duration,
    /// When the single background resubmission fires
    pub resubmit_after: Duration,
}

/// Retry policy plus global rate-limit state
#[derive(Debug)]
pub struct RetryController {
    max_retries: u32,
    backoff_table: Vec<Duration>,
    default_reset: Duration,
    resubmit_delay: Duration,
    reset_at: Mutex<Option<Instant>>,
}

impl RetryController {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_table: config
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            default_reset: Duration::from_secs(config.rate_limit_default_reset_secs),
            resubmit_delay: Duration::from_secs(config.rate_limit_resubmit_secs),
            reset_at: Mutex::new(None),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff delay for an item that has already been retried `retry_count` times
    ///
    /// Indices past the end of the table reuse the last entry.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let index = (retry_count as usize).min(self.backoff_table.len().saturating_sub(1));
        self.backoff_table
            .get(index)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Decide the fate of one item whose batch failed with `kind`
    ///
    /// Rate limiting is batch-wide and handled by `on_rate_limited`; if it
    /// reaches here anyway it is treated as a rejection.
    pub fn decide(&self, kind: &SubmitErrorKind, retry_count: u32) -> RetryDecision {
        if kind.is_retryable() {
            return if retry_count < self.max_retries {
                RetryDecision::Retry {
                    delay: self.backoff_for(retry_count),
                    retry_count: retry_count + 1,
                }
            } else {
                RetryDecision::Fail(FailureReason::RetriesExhausted)
            };
        }

        match kind {
            SubmitErrorKind::NotFound => RetryDecision::Fail(FailureReason::NotFound),
            SubmitErrorKind::MalformedResponse => RetryDecision::AcceptEmpty,
            _ => RetryDecision::Fail(FailureReason::Rejected),
        }
    }

    /// Close the global gate and plan the background resubmission
    ///
    /// The resubmission delay is fixed and independent of the hint; the
    /// flush gate still holds the actual network call until the window ends.
    pub fn on_rate_limited(&self, retry_after: Option<Duration>) -> RateLimitPlan {
        let reset_after = retry_after.unwrap_or(self.default_reset);
        *self.gate() = Some(Instant::now() + reset_after);

        info!(
            reset_after_secs = reset_after.as_secs(),
            hinted = retry_after.is_some(),
            "Global rate limit window opened"
        );

        RateLimitPlan {
            reset_after,
            resubmit_after: self.resubmit_delay,
        }
    }

    /// Time left in the current rate-limit window, if one is active
    pub fn rate_limit_remaining(&self) -> Option<Duration> {
        let mut gate = self.gate();
        match *gate {
            Some(reset_at) => {
                let now = Instant::now();
                if now < reset_at {
                    Some(reset_at - now)
                } else {
                    debug!("Rate limit window elapsed");
                    *gate = None;
                    None
                }
            }
            None => None,
        }
    }

    /// Forget any rate-limit window (called after a successful submission)
    pub fn clear_rate_limit(&self) {
        let mut gate = self.gate();
        if gate.take().is_some() {
            info!("Rate limit cleared after successful submission");
        }
    }

    fn gate(&self) -> MutexGuard<'_, Option<Instant>> {
        self.reset_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RetryController {
        RetryController::new(&RetryConfig::default())
    }

    #[test]
    fn test_backoff_table_lookup_and_clamp() {
        let c = controller();
        assert_eq!(c.backoff_for(0), Duration::from_secs(30));
        assert_eq!(c.backoff_for(1), Duration::from_secs(60));
        assert_eq!(c.backoff_for(4), Duration::from_secs(600));
        assert_eq!(c.backoff_for(9), Duration::from_secs(600));
    }

    #[test]
    fn test_transient_retries_until_budget_spent() {
        let c = controller();
        assert_eq!(
            c.decide(&SubmitErrorKind::TransientServer, 0),
            RetryDecision::Retry {
                delay: Duration::from_secs(30),
                retry_count: 1
            }
        );
        assert_eq!(
            c.decide(&SubmitErrorKind::Network, 4),
            RetryDecision::Retry {
                delay: Duration::from_secs(600),
                retry_count: 5
            }
        );
        assert_eq!(
            c.decide(&SubmitErrorKind::Network, 5),
            RetryDecision::Fail(FailureReason::RetriesExhausted)
        );
    }

    #[test]
    fn test_retry_count_strictly_increases_and_stays_bounded() {
        let c = controller();
        let mut count = 0;
        let mut seen = Vec::new();
        while let RetryDecision::Retry { retry_count, .. } =
            c.decide(&SubmitErrorKind::TransientServer, count)
        {
            assert!(retry_count > count);
            assert!(retry_count <= c.max_retries());
            seen.push(retry_count);
            count = retry_count;
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_terminal_kinds() {
        let c = controller();
        assert_eq!(
            c.decide(&SubmitErrorKind::NotFound, 0),
            RetryDecision::Fail(FailureReason::NotFound)
        );
        assert_eq!(
            c.decide(&SubmitErrorKind::NonRetryable, 0),
            RetryDecision::Fail(FailureReason::Rejected)
        );
        assert_eq!(
            c.decide(&SubmitErrorKind::MalformedResponse, 3),
            RetryDecision::AcceptEmpty
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window_uses_hint_then_expires() {
        let c = controller();
        let plan = c.on_rate_limited(Some(Duration::from_secs(60)));
        assert_eq!(plan.reset_after, Duration::from_secs(60));
        assert_eq!(plan.resubmit_after, Duration::from_secs(30));
        assert_eq!(c.rate_limit_remaining(), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(c.rate_limit_remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_default_and_clear() {
        let c = controller();
        let plan = c.on_rate_limited(None);
        assert_eq!(plan.reset_after, Duration::from_secs(120));
        assert!(c.rate_limit_remaining().is_some());

        c.clear_rate_limit();
        assert_eq!(c.rate_limit_remaining(), None);
    }
}
