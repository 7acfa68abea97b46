use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::lock;

/// Sliding-window admission control.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.limit, Duration::from_millis(config.window_ms))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record an operation if the window has room. Denials leave no trace.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut admitted = lock(&self.admitted);
        prune_window(&mut admitted, now, self.window);
        if admitted.len() >= self.limit {
            return false;
        }
        admitted.push_back(now);
        true
    }

    pub fn window_len(&self) -> usize {
        let mut admitted = lock(&self.admitted);
        prune_window(&mut admitted, Instant::now(), self.window);
        admitted.len()
    }
}

/// Drop entries that are at least `window` old.
pub(crate) fn prune_window(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = entries.front() {
        if now.duration_since(*oldest) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}
