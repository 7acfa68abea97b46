//! Debounced, throttled single-conversation sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{json, Value};
use threadline_core::{is_thread_url, thread_key_from_url, ExtractedPayload};
use threadline_extract::{AbortSignal, ExtractError, ExtractOptions, Extractor};
use threadline_transport::{ResponseBody, Transport};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{auth_headers, body_user_id, AuthProvider};
use crate::breaker::CircuitBreaker;
use crate::config::ThreadSyncConfig;
use crate::error::SyncError;
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Throttled,
    NotAThread,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Skipped {
        reason: SkipReason,
    },
    Sent {
        thread_key: String,
        status: u16,
        attempts: u32,
        body: ResponseBody,
    },
    Failed {
        thread_key: String,
        attempts: u32,
        error: SyncError,
    },
}

impl SyncOutcome {
    /// Skips are successful no-ops; only failures report `ok: false`.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// `{ok, skipped, reason}` for skips, `{ok, thread_key, status, attempts, data}`
/// or `{ok, thread_key, attempts, error}` otherwise.
impl Serialize for SyncOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("ok", &self.is_ok())?;
        match self {
            Self::Skipped { reason } => {
                map.serialize_entry("skipped", &true)?;
                map.serialize_entry("reason", reason)?;
            }
            Self::Sent {
                thread_key,
                status,
                attempts,
                body,
            } => {
                map.serialize_entry("thread_key", thread_key)?;
                map.serialize_entry("status", status)?;
                map.serialize_entry("attempts", attempts)?;
                map.serialize_entry("data", body)?;
            }
            Self::Failed {
                thread_key,
                attempts,
                error,
            } => {
                map.serialize_entry("thread_key", thread_key)?;
                map.serialize_entry("attempts", attempts)?;
                map.serialize_entry("error", error)?;
            }
        }
        map.end()
    }
}

pub struct ThreadSyncDeps {
    pub endpoint: String,
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<dyn AuthProvider>,
    pub extractor: Arc<dyn Extractor>,
    pub breaker: Arc<CircuitBreaker>,
}

#[derive(Clone)]
pub struct ThreadSyncScheduler {
    inner: Arc<ThreadSyncInner>,
}

struct ThreadSyncInner {
    config: ThreadSyncConfig,
    deps: ThreadSyncDeps,
    shutdown: AbortSignal,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    last_url: Option<String>,
    debounce: Option<DebounceSlot>,
    next_debounce_id: u64,
    last_sync_at: HashMap<String, Instant>,
}

struct DebounceSlot {
    id: u64,
    handle: JoinHandle<()>,
}

impl ThreadSyncScheduler {
    pub fn new(config: ThreadSyncConfig, deps: ThreadSyncDeps) -> Self {
        Self {
            inner: Arc::new(ThreadSyncInner {
                config,
                deps,
                shutdown: AbortSignal::new(),
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Record a navigation. Returns `false` when the URL did not change.
    ///
    /// Any new URL cancels a pending debounce; thread URLs arm a fresh one, so
    /// only the last observation of a burst syncs.
    pub fn on_url_observed(&self, url: &str) -> bool {
        let mut state = lock(&self.inner.state);
        if state.last_url.as_deref() == Some(url) {
            return false;
        }
        state.last_url = Some(url.to_string());
        if let Some(pending) = state.debounce.take() {
            pending.handle.abort();
            debug!(debounce_id = pending.id, "pending thread sync superseded");
        }
        if self.inner.shutdown.should_abort()
            || !is_thread_url(url, &self.inner.config.thread_path_prefix)
        {
            return true;
        }

        state.next_debounce_id += 1;
        let id = state.next_debounce_id;
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce()).await;
            {
                let mut state = lock(&inner.state);
                if !state.debounce.as_ref().is_some_and(|slot| slot.id == id) {
                    return;
                }
                state.debounce = None;
            }
            let outcome = ThreadSyncScheduler { inner }.run_sync(&url).await;
            debug!(?outcome, "debounced thread sync finished");
        });
        state.debounce = Some(DebounceSlot { id, handle });
        true
    }

    /// Sync `url` now, bypassing the debounce but not the throttle.
    pub async fn trigger_thread_sync(&self, url: &str) -> SyncOutcome {
        self.run_sync(url).await
    }

    pub fn has_pending_debounce(&self) -> bool {
        lock(&self.inner.state).debounce.is_some()
    }

    /// Cancel the pending debounce and abort in-flight extractions.
    pub fn shutdown(&self) {
        if let Some(pending) = lock(&self.inner.state).debounce.take() {
            pending.handle.abort();
        }
        self.inner.shutdown.abort();
    }

    async fn run_sync(&self, url: &str) -> SyncOutcome {
        let Some(thread_key) = thread_key_from_url(url, &self.inner.config.thread_path_prefix)
        else {
            return SyncOutcome::Skipped {
                reason: SkipReason::NotAThread,
            };
        };

        {
            let now = Instant::now();
            let mut state = lock(&self.inner.state);
            let throttled = state
                .last_sync_at
                .get(&thread_key)
                .is_some_and(|last| now.duration_since(*last) < self.inner.config.throttle());
            if throttled {
                debug!(%thread_key, "thread sync throttled");
                return SyncOutcome::Skipped {
                    reason: SkipReason::Throttled,
                };
            }
            state.last_sync_at.insert(thread_key.clone(), now);
        }

        let span = info_span!("thread_sync", %thread_key);
        async {
            let payload = match self.extract(url).await {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(error = %error, "thread extraction failed");
                    return SyncOutcome::Failed {
                        thread_key,
                        attempts: 0,
                        error,
                    };
                }
            };
            self.send_sync(thread_key, url, payload).await
        }
        .instrument(span)
        .await
    }

    async fn extract(&self, url: &str) -> Result<ExtractedPayload, SyncError> {
        let extractor = &self.inner.deps.extractor;
        let handle = extractor.root_handle(url).await.map_err(extraction_error)?;
        let options = ExtractOptions {
            fill_missing_time: true,
            signal: self.inner.shutdown.child(),
        };
        match extractor.extract(&handle, &options).await {
            Ok(Some(payload)) if payload.is_usable() => Ok(payload),
            Ok(_) => Err(SyncError::validation("no usable conversation payload")),
            Err(err) => Err(extraction_error(err)),
        }
    }

    async fn send_sync(
        &self,
        thread_key: String,
        url: &str,
        payload: ExtractedPayload,
    ) -> SyncOutcome {
        let deps = &self.inner.deps;
        if deps.breaker.is_open() {
            warn!("circuit breaker open; thread sync declined");
            return SyncOutcome::Failed {
                thread_key,
                attempts: 0,
                error: SyncError::CircuitOpen,
            };
        }

        let auth = deps.auth.auth_context().await;
        let headers = match auth_headers(&auth) {
            Ok(headers) => headers,
            Err(error) => {
                warn!(error = %error, "thread sync skipped without credentials");
                return SyncOutcome::Failed {
                    thread_key,
                    attempts: 0,
                    error,
                };
            }
        };
        let mut body = json!({ "payload": payload, "threadUrl": url });
        if let (Value::Object(fields), Some(user_id)) = (&mut body, body_user_id(&auth)) {
            fields.insert("user_id".into(), Value::String(user_id.to_string()));
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let error = match deps
                .transport
                .post_json(&deps.endpoint, headers.clone(), &body)
                .await
            {
                Ok(response) if response.ok() => {
                    info!(status = response.status, attempts, "thread synced");
                    return SyncOutcome::Sent {
                        thread_key,
                        status: response.status,
                        attempts,
                        body: response.body,
                    };
                }
                Ok(response) => SyncError::from_status(response.status, response.body),
                Err(err) if attempts == 1 && err.is_connection_failure() => {
                    warn!(error = %err, "thread sync transport failure; retrying once");
                    let delay = self.inner.config.retry_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = self.inner.shutdown.aborted() => SyncError::from(err),
                    }
                }
                Err(err) => SyncError::from(err),
            };

            if error.is_remote_failure() {
                deps.breaker.record_error();
            }
            warn!(error = %error, attempts, "thread sync failed");
            return SyncOutcome::Failed {
                thread_key,
                attempts,
                error,
            };
        }
    }
}

fn extraction_error(err: ExtractError) -> SyncError {
    SyncError::Extraction {
        message: err.to_string(),
    }
}
