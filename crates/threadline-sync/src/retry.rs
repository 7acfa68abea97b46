use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use threadline_core::QueueItem;
use threadline_extract::AbortSignal;
use threadline_transport::BackoffPolicy;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { delay: Duration },
    Dropped,
}

/// Bounded exponential-backoff resubmission of failed batch items.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: BackoffPolicy,
    shutdown: AbortSignal,
    pending: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            shutdown: AbortSignal::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.policy.delay_for_attempt(attempt)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait `backoff(attempt)` without blocking the caller, then hand the item
    /// back with `attempt + 1`. Items that used up the retry budget are dropped.
    pub fn schedule_retry<F>(&self, item: QueueItem, attempt: u32, resubmit: F) -> RetryDecision
    where
        F: FnOnce(QueueItem) + Send + 'static,
    {
        if attempt >= self.policy.max_retries {
            warn!(
                key = %item.key,
                attempt,
                max_retries = self.policy.max_retries,
                "retry budget exhausted; dropping item"
            );
            return RetryDecision::Dropped;
        }
        if self.shutdown.should_abort() {
            warn!(key = %item.key, "retry scheduler shut down; dropping item");
            return RetryDecision::Dropped;
        }

        let delay = self.backoff(attempt);
        debug!(key = %item.key, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
        let shutdown = self.shutdown.clone();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    resubmit(item.with_attempt(attempt + 1));
                }
                _ = shutdown.aborted() => {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    debug!(key = %item.key, "pending retry cancelled");
                }
            }
        });
        RetryDecision::Scheduled { delay }
    }

    /// Cancel pending retries and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.abort();
    }
}
