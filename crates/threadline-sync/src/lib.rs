//! Threadline sync engine: batched event ingestion, single-thread sync and the
//! scrape controller, sharing one circuit breaker and rate limiter.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod auth;
pub mod batch;
pub mod breaker;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod rate_limit;
pub mod retry;
pub mod thread_sync;

#[cfg(test)]
mod testing;

pub use auth::{AuthProvider, EnvAuthProvider, StaticAuthProvider};
pub use batch::{sanitize, BatchIngestionQueue, EnqueueOutcome, FlushOutcome};
pub use breaker::CircuitBreaker;
pub use config::SyncConfig;
pub use controller::{
    ProfileIngestJob, ScrapeContext, ScrapeJob, ScrapeTaskController, TriggerOutcome,
    TriggerReason,
};
pub use engine::{Collaborators, Engine};
pub use error::{ConfigError, SyncError};
pub use rate_limit::RateLimiter;
pub use retry::{RetryDecision, RetryScheduler};
pub use thread_sync::{SkipReason, SyncOutcome, ThreadSyncScheduler};

pub const CRATE_NAME: &str = "threadline-sync";

/// Lock a state mutex. Critical sections never await, and a panic inside one
/// leaves the data consistent, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
