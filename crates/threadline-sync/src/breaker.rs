use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::config::BreakerConfig;
use crate::lock;
use crate::rate_limit::prune_window;

/// Error-rate tripwire guarding outbound calls.
///
/// Open while at least `threshold` errors fall inside the trailing window.
/// There is no stored closed state: the breaker heals as errors age out.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: usize,
    window: Duration,
    errors: Mutex<VecDeque<Instant>>,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.threshold, Duration::from_millis(config.window_ms))
    }

    /// Returns `true` when the breaker is open after recording.
    pub fn record_error(&self) -> bool {
        let now = Instant::now();
        let mut errors = lock(&self.errors);
        prune_window(&mut errors, now, self.window);
        errors.push_back(now);
        let open = errors.len() >= self.threshold;
        if open {
            warn!(
                errors = errors.len(),
                threshold = self.threshold,
                "circuit breaker open"
            );
        }
        open
    }

    pub fn is_open(&self) -> bool {
        self.error_count() >= self.threshold
    }

    pub fn error_count(&self) -> usize {
        let mut errors = lock(&self.errors);
        prune_window(&mut errors, Instant::now(), self.window);
        errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_heals_after_window() {
        let breaker = CircuitBreaker::from_config(&BreakerConfig::default());
        for _ in 0..4 {
            assert!(!breaker.record_error());
        }
        assert!(!breaker.is_open());
        assert!(breaker.record_error());
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spread_out_errors_never_open() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        for _ in 0..6 {
            assert!(!breaker.record_error());
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn heals_partially_as_oldest_errors_expire() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.record_error();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.record_error());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.error_count(), 1);
    }
}
