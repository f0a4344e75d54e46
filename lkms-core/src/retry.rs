//! Retry and failure-detection policy for the southbound link
//!
//! Transient link faults are retried with exponential backoff and jitter.
//! The circuit breaker decides when the link stops being "degraded" and is
//! treated as permanently unavailable; sessions touching an unavailable
//! link fail with `no_connection`.

use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for southbound pulls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts per pull
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Add jitter to avoid synchronized retries
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Execute an operation, retrying retryable failures
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = self.initial_backoff;

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "attempt {}/{} failed: {}. retrying after {:?}",
                        attempt, self.max_attempts, e, backoff
                    );
                    sleep(self.with_jitter(backoff)).await;
                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.multiplier)
                            .min(self.max_backoff.as_secs_f64()),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal("retry loop exhausted".to_string()))
    }

    fn with_jitter(&self, duration: Duration) -> Duration {
        if !self.jitter {
            return duration;
        }
        use rand::Rng;
        let extra = rand::thread_rng().gen_range(0..=duration.as_millis() / 4);
        duration + Duration::from_millis(extra as u64)
    }
}

/// Consecutive-failure detector for the southbound link
///
/// Once `failure_threshold` pulls in a row have failed, the breaker opens and
/// the link counts as unavailable until `reset_timeout` has elapsed since the
/// last failure.
pub struct CircuitBreaker {
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    reset_timeout: Duration,
    last_failure: parking_lot::Mutex<Option<std::time::Instant>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            consecutive_failures: AtomicU32::new(0),
            reset_timeout,
            last_failure: parking_lot::Mutex::new(None),
        }
    }

    /// Whether the link is currently considered down
    pub fn is_open(&self) -> bool {
        if self.consecutive_failures.load(Ordering::Relaxed) < self.failure_threshold {
            return false;
        }
        let last = *self.last_failure.lock();
        match last {
            Some(at) if at.elapsed() < self.reset_timeout => true,
            _ => {
                self.reset();
                false
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.lock() = Some(std::time::Instant::now());
    }

    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_failure.lock() = None;
    }
}
