//! Cooperative state machine guaranteeing at most one in-flight extraction.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use threadline_core::ControllerState;
use threadline_extract::{AbortSignal, ExtractError, ProfileExtractor};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchIngestionQueue, EnqueueOutcome};
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    Navigation,
    Mutation,
    Scheduled,
}

/// Handed to each job run. Jobs poll [`ScrapeContext::should_abort`] at safe
/// points and return early once it flips.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    pub reason: TriggerReason,
    pub signal: AbortSignal,
}

impl ScrapeContext {
    pub fn should_abort(&self) -> bool {
        self.signal.should_abort()
    }
}

#[async_trait]
pub trait ScrapeJob: Send + Sync {
    async fn run(&self, ctx: ScrapeContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    NotRunning { state: ControllerState },
    /// An extraction was already in flight; this trigger was dropped.
    Coalesced,
    Completed,
    Failed { message: String },
}

#[derive(Clone)]
pub struct ScrapeTaskController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    job: Arc<dyn ScrapeJob>,
    slot: Mutex<TaskSlot>,
}

struct TaskSlot {
    state: ControllerState,
    signal: AbortSignal,
    in_flight: bool,
}

impl ScrapeTaskController {
    pub fn new(job: Arc<dyn ScrapeJob>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                job,
                slot: Mutex::new(TaskSlot {
                    state: ControllerState::Idle,
                    signal: AbortSignal::new(),
                    in_flight: false,
                }),
            }),
        }
    }

    pub fn state(&self) -> ControllerState {
        lock(&self.inner.slot).state
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.inner.slot).in_flight
    }

    pub fn start(&self) -> ControllerState {
        let mut slot = lock(&self.inner.slot);
        slot.signal = AbortSignal::new();
        slot.state = ControllerState::Running;
        info!("scrape controller started");
        slot.state
    }

    pub fn pause(&self) -> ControllerState {
        let mut slot = lock(&self.inner.slot);
        slot.signal.abort();
        if slot.state == ControllerState::Running {
            slot.state = ControllerState::Paused;
        }
        info!(state = %slot.state, "scrape controller paused");
        slot.state
    }

    pub fn stop(&self) -> ControllerState {
        let mut slot = lock(&self.inner.slot);
        slot.signal.abort();
        slot.state = ControllerState::Stopped;
        info!("scrape controller stopped");
        slot.state
    }

    /// Run the job once if the controller is running and idle.
    pub async fn trigger(&self, reason: TriggerReason) -> TriggerOutcome {
        let signal = {
            let mut slot = lock(&self.inner.slot);
            if slot.state != ControllerState::Running {
                return TriggerOutcome::NotRunning { state: slot.state };
            }
            if slot.in_flight {
                debug!(?reason, "extraction already in flight; trigger coalesced");
                return TriggerOutcome::Coalesced;
            }
            slot.signal = AbortSignal::new();
            slot.in_flight = true;
            slot.signal.clone()
        };

        let inner = Arc::clone(&self.inner);
        let ctx = ScrapeContext { reason, signal };
        // The guard lives in the spawned task so in-flight clears with the job,
        // even if this trigger future is dropped.
        let run = tokio::spawn(async move {
            let mut guard = InFlightGuard {
                inner: Arc::clone(&inner),
                failed: false,
            };
            let result = inner.job.run(ctx).await;
            guard.failed = result.is_err();
            result
        });

        match run.await {
            Ok(Ok(())) => TriggerOutcome::Completed,
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), ?reason, "extraction failed");
                TriggerOutcome::Failed {
                    message: format!("{err:#}"),
                }
            }
            Err(join_err) => {
                error!(error = %join_err, ?reason, "extraction panicked");
                TriggerOutcome::Failed {
                    message: join_err.to_string(),
                }
            }
        }
    }
}

struct InFlightGuard {
    inner: Arc<ControllerInner>,
    failed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.inner.slot);
        slot.in_flight = false;
        if self.failed || std::thread::panicking() {
            slot.state = ControllerState::Error;
        }
    }
}

/// Pulls profile records from an extractor and enqueues each for batching.
pub struct ProfileIngestJob {
    extractor: Arc<dyn ProfileExtractor>,
    queue: BatchIngestionQueue,
}

impl ProfileIngestJob {
    pub fn new(extractor: Arc<dyn ProfileExtractor>, queue: BatchIngestionQueue) -> Self {
        Self { extractor, queue }
    }
}

#[async_trait]
impl ScrapeJob for ProfileIngestJob {
    async fn run(&self, ctx: ScrapeContext) -> anyhow::Result<()> {
        let records = match self.extractor.extract_profiles(&ctx.signal).await {
            Ok(records) => records,
            Err(ExtractError::Aborted) => {
                info!(reason = ?ctx.reason, "profile extraction aborted");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut accepted = 0usize;
        let mut duplicates = 0usize;
        for record in records {
            if ctx.should_abort() {
                info!(accepted, "profile ingestion aborted");
                return Ok(());
            }
            match self.queue.enqueue(record.key, record.payload) {
                Ok(EnqueueOutcome::Accepted { .. }) => accepted += 1,
                Ok(EnqueueOutcome::Duplicate { .. }) => duplicates += 1,
                Err(err) => warn!(error = %err, "profile record rejected"),
            }
        }
        info!(reason = ?ctx.reason, accepted, duplicates, "profile ingestion finished");
        Ok(())
    }
}
