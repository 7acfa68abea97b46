//! Deduplicating, size- and time-triggered batch delivery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::{Map, Value};
use threadline_core::{EventPayload, QueueItem};
use threadline_transport::Transport;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{auth_headers, body_user_id, AuthProvider};
use crate::breaker::CircuitBreaker;
use crate::config::BatchConfig;
use crate::error::SyncError;
use crate::lock;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Accepted { queue_length: usize },
    /// An item with the same key is already pending; the new one was ignored.
    Duplicate { queue_length: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// Nothing pending, or another flush is already in flight.
    Idle,
    CircuitOpen,
    RateLimited,
    Sent { count: usize, status: u16 },
    Failed { count: usize, error: SyncError },
}

/// Shared collaborators of the batch queue.
pub struct BatchDeps {
    pub endpoint: String,
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<dyn AuthProvider>,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryScheduler,
}

#[derive(Clone)]
pub struct BatchIngestionQueue {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    config: BatchConfig,
    deps: BatchDeps,
    state: Mutex<BatchState>,
}

#[derive(Default)]
struct BatchState {
    pending: VecDeque<QueueItem>,
    timer: Option<TimerSlot>,
    next_timer_id: u64,
    in_flight: bool,
    closed: bool,
}

struct TimerSlot {
    id: u64,
    handle: JoinHandle<()>,
}

enum FlushStart {
    Batch(Vec<QueueItem>),
    Declined(FlushOutcome),
}

impl BatchIngestionQueue {
    pub fn new(config: BatchConfig, deps: BatchDeps) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                config,
                deps,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    /// Admit one event. Must be called from within a tokio runtime.
    pub fn enqueue(
        &self,
        key: impl Into<String>,
        payload: EventPayload,
    ) -> Result<EnqueueOutcome, SyncError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(SyncError::validation("event key must not be empty"));
        }
        Ok(self.inner.submit(QueueItem::new(key, payload)))
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.inner.flush().await
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushing(&self) -> bool {
        lock(&self.inner.state).in_flight
    }

    pub fn pending_keys(&self) -> Vec<String> {
        lock(&self.inner.state)
            .pending
            .iter()
            .map(|item| item.key.clone())
            .collect()
    }

    /// Disarm the timer for good and cancel pending retries. Pending items stay
    /// queued and can still be sent with an explicit [`flush`](Self::flush).
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        state.closed = true;
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        drop(state);
        self.inner.deps.retry.shutdown();
    }
}

impl BatchInner {
    fn submit(self: &Arc<Self>, item: QueueItem) -> EnqueueOutcome {
        let mut state = lock(&self.state);
        if state.pending.iter().any(|pending| pending.key == item.key) {
            debug!(key = %item.key, "duplicate pending key; ignoring event");
            return EnqueueOutcome::Duplicate {
                queue_length: state.pending.len(),
            };
        }
        debug!(key = %item.key, attempt = item.attempt, "event enqueued");
        state.pending.push_back(item);

        if state.pending.len() >= self.config.max_batch_size {
            if let FlushStart::Batch(batch) = self.start_flush(&mut state) {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    inner.drive(batch).await;
                });
            }
        } else {
            self.arm_timer(&mut state);
        }
        EnqueueOutcome::Accepted {
            queue_length: state.pending.len(),
        }
    }

    /// Re-enqueue a retried item. A newer pending item with the same key wins
    /// and the retried one is lost.
    fn resubmit(self: &Arc<Self>, item: QueueItem) -> EnqueueOutcome {
        let key = item.key.clone();
        let attempt = item.attempt;
        let outcome = self.submit(item);
        if let EnqueueOutcome::Duplicate { .. } = outcome {
            warn!(%key, attempt, "retried item superseded by a newer pending event; dropping it");
        }
        outcome
    }

    async fn flush(self: &Arc<Self>) -> FlushOutcome {
        let start = {
            let mut state = lock(&self.state);
            self.start_flush(&mut state)
        };
        match start {
            FlushStart::Batch(batch) => self.drive(batch).await,
            FlushStart::Declined(outcome) => outcome,
        }
    }

    /// Synchronous half of a flush: gate checks and taking the batch.
    fn start_flush(self: &Arc<Self>, state: &mut BatchState) -> FlushStart {
        if state.in_flight || state.pending.is_empty() {
            return FlushStart::Declined(FlushOutcome::Idle);
        }
        if self.deps.breaker.is_open() {
            warn!(pending = state.pending.len(), "circuit open; deferring flush");
            self.arm_timer(state);
            return FlushStart::Declined(FlushOutcome::CircuitOpen);
        }
        if !self.deps.limiter.admit() {
            warn!(pending = state.pending.len(), "rate limited; deferring flush");
            self.arm_timer(state);
            return FlushStart::Declined(FlushOutcome::RateLimited);
        }

        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        state.in_flight = true;
        let take = state.pending.len().min(self.config.max_batch_size);
        FlushStart::Batch(state.pending.drain(..take).collect())
    }

    /// Deliver `first`, then keep going while full batches are waiting.
    async fn drive(self: &Arc<Self>, first: Vec<QueueItem>) -> FlushOutcome {
        let mut batch = first;
        let mut first_outcome = None;
        loop {
            let flush_id = Uuid::new_v4();
            let span = info_span!("batch_flush", %flush_id, batch_size = batch.len());
            let outcome = self.deliver(batch).instrument(span).await;
            if first_outcome.is_none() {
                first_outcome = Some(outcome);
            }

            let next = {
                let mut state = lock(&self.state);
                state.in_flight = false;
                if state.pending.len() >= self.config.max_batch_size {
                    match self.start_flush(&mut state) {
                        FlushStart::Batch(next) => Some(next),
                        FlushStart::Declined(_) => None,
                    }
                } else {
                    if !state.pending.is_empty() {
                        self.arm_timer(&mut state);
                    }
                    None
                }
            };
            match next {
                Some(next) => batch = next,
                None => break,
            }
        }
        first_outcome.unwrap_or(FlushOutcome::Idle)
    }

    async fn deliver(self: &Arc<Self>, batch: Vec<QueueItem>) -> FlushOutcome {
        let count = batch.len();
        let auth = self.deps.auth.auth_context().await;
        let headers = match auth_headers(&auth) {
            Ok(headers) => headers,
            Err(error) => return self.fail(batch, error),
        };

        let user_id = body_user_id(&auth);
        let events: Vec<Value> = batch
            .iter()
            .map(|item| {
                let mut event = sanitize(&item.key, &item.payload, &self.config);
                if let (Value::Object(fields), Some(user_id)) = (&mut event, user_id) {
                    fields.insert("user_id".to_string(), Value::String(user_id.to_string()));
                }
                event
            })
            .collect();

        let result = self
            .deps
            .transport
            .send_batch(&self.deps.endpoint, headers, &events)
            .await;
        match result {
            Ok(resp) if resp.ok() => {
                info!(count, status = resp.status, "batch delivered");
                FlushOutcome::Sent {
                    count,
                    status: resp.status,
                }
            }
            Ok(resp) => {
                let error = SyncError::from_status(resp.status, resp.body);
                match &error {
                    SyncError::RetryableServer { status, .. } => {
                        warn!(status, count, "batch rejected with retryable status")
                    }
                    _ => warn!(status = resp.status, count, "batch rejected"),
                }
                self.fail(batch, error)
            }
            Err(err) => {
                warn!(error = %err, count, "batch transport failure");
                self.fail(batch, SyncError::from(err))
            }
        }
    }

    /// Every failure sends the whole batch through the retry path.
    fn fail(self: &Arc<Self>, batch: Vec<QueueItem>, error: SyncError) -> FlushOutcome {
        let count = batch.len();
        if error.is_remote_failure() {
            self.deps.breaker.record_error();
        } else {
            warn!(%error, count, "batch not sent");
        }
        for item in batch {
            let attempt = item.attempt;
            let weak: Weak<BatchInner> = Arc::downgrade(self);
            self.deps.retry.schedule_retry(item, attempt, move |item| {
                if let Some(inner) = weak.upgrade() {
                    inner.resubmit(item);
                }
            });
        }
        FlushOutcome::Failed { count, error }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut BatchState) {
        if state.timer.is_some() || state.closed {
            return;
        }
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let delay = self.config.debounce();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = lock(&inner.state);
                if state.timer.as_ref().map(|t| t.id) != Some(id) {
                    return;
                }
                // Detach before flushing so the flush cannot abort this task.
                state.timer = None;
            }
            inner.flush().await;
        });
        state.timer = Some(TimerSlot { id, handle });
    }
}

/// Allow-listed copy of `payload` with every string cut to `max_field_chars`.
/// The event always carries its `key`, never truncated.
pub fn sanitize(key: &str, payload: &EventPayload, config: &BatchConfig) -> Value {
    let limit = config.max_field_chars;
    let mut event = Map::new();
    event.insert("key".to_string(), Value::String(key.to_string()));
    for field in &config.allowed_fields {
        if field == "key" {
            continue;
        }
        if let Some(value) = payload.get(field) {
            event.insert(field.clone(), truncate_value(value, limit));
        }
    }
    Value::Object(event)
}

fn truncate_value(value: &Value, limit: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_chars(s, limit)),
        Value::Array(items) => Value::Array(items.iter().map(|v| truncate_value(v, limit)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), truncate_value(v, limit)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
