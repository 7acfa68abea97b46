use std::sync::Arc;

use anyhow::{Context, Result};
use threadline_core::{Diagnostics, EventPayload};
use threadline_extract::{Extractor, HtmlSnapshotExtractor, JsonProfileExtractor, ProfileExtractor};
use threadline_transport::{HttpTransport, Transport};
use tracing::{debug, info};

use crate::auth::{AuthProvider, EnvAuthProvider};
use crate::batch::{BatchDeps, BatchIngestionQueue, EnqueueOutcome, FlushOutcome};
use crate::breaker::CircuitBreaker;
use crate::config::SyncConfig;
use crate::controller::{ProfileIngestJob, ScrapeTaskController, TriggerReason};
use crate::error::SyncError;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryScheduler;
use crate::thread_sync::{SyncOutcome, ThreadSyncDeps, ThreadSyncScheduler};

/// Injected seams. Tests swap these for in-memory doubles.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<dyn AuthProvider>,
    pub extractor: Arc<dyn Extractor>,
    pub profiles: Arc<dyn ProfileExtractor>,
}

/// Owns every component and the state they share: one breaker guards both
/// the batch queue and thread sync, one limiter paces batch flushes.
pub struct Engine {
    config: SyncConfig,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    queue: BatchIngestionQueue,
    threads: ThreadSyncScheduler,
    controller: ScrapeTaskController,
}

impl Engine {
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let breaker = Arc::new(CircuitBreaker::from_config(&config.breaker));

        let queue = BatchIngestionQueue::new(
            config.batch.clone(),
            BatchDeps {
                endpoint: config.endpoints.batch_url.clone(),
                transport: Arc::clone(&collaborators.transport),
                auth: Arc::clone(&collaborators.auth),
                limiter: Arc::clone(&limiter),
                breaker: Arc::clone(&breaker),
                retry: RetryScheduler::new(config.retry.policy()),
            },
        );
        let threads = ThreadSyncScheduler::new(
            config.thread_sync.clone(),
            ThreadSyncDeps {
                endpoint: config.endpoints.thread_sync_url.clone(),
                transport: collaborators.transport,
                auth: collaborators.auth,
                extractor: collaborators.extractor,
                breaker: Arc::clone(&breaker),
            },
        );
        let controller = ScrapeTaskController::new(Arc::new(ProfileIngestJob::new(
            collaborators.profiles,
            queue.clone(),
        )));

        Self {
            config,
            limiter,
            breaker,
            queue,
            threads,
            controller,
        }
    }

    /// Production wiring: reqwest transport, env credentials, snapshot extractors.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate().context("validating sync config")?;
        let transport =
            HttpTransport::new(config.http.client_config()).context("building http transport")?;
        let extractor = HtmlSnapshotExtractor::new(&config.snapshots.threads_dir)
            .with_thread_path_prefix(config.thread_sync.thread_path_prefix.clone());
        let profiles = JsonProfileExtractor::new(&config.snapshots.profiles_dir);
        info!(
            batch_url = %config.endpoints.batch_url,
            thread_sync_url = %config.endpoints.thread_sync_url,
            threads_dir = %config.snapshots.threads_dir.display(),
            "engine configured"
        );
        Ok(Self::new(
            config,
            Collaborators {
                transport: Arc::new(transport),
                auth: Arc::new(EnvAuthProvider),
                extractor: Arc::new(extractor),
                profiles: Arc::new(profiles),
            },
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn enqueue(
        &self,
        key: impl Into<String>,
        payload: EventPayload,
    ) -> Result<EnqueueOutcome, SyncError> {
        self.queue.enqueue(key, payload)
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.queue.flush().await
    }

    pub async fn trigger_thread_sync(&self, url: &str) -> SyncOutcome {
        self.threads.trigger_thread_sync(url).await
    }

    /// Feed a navigation to the thread scheduler and, when the URL changed,
    /// kick the scrape controller in the background.
    pub fn on_url_observed(&self, url: &str) -> bool {
        let changed = self.threads.on_url_observed(url);
        if changed {
            let controller = self.controller.clone();
            tokio::spawn(async move {
                let outcome = controller.trigger(TriggerReason::Navigation).await;
                debug!(?outcome, "navigation trigger finished");
            });
        }
        changed
    }

    pub fn controller(&self) -> &ScrapeTaskController {
        &self.controller
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            queue_length: self.queue.len(),
            breaker_open: self.breaker.is_open(),
            rate_window_length: self.limiter.window_len(),
            controller_state: self.controller.state(),
        }
    }

    /// Stop the controller, cancel timers and retries, then try one last flush.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.controller.stop();
        self.threads.shutdown();
        self.queue.shutdown();
        let outcome = self.queue.flush().await;
        info!(?outcome, remaining = self.queue.len(), "engine shut down");
        outcome
    }
}
