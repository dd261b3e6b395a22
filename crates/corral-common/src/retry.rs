//! Bounded retries with exponential backoff and jitter
//!
//! Used for writes against the management API (status patches) where a
//! transient failure should not drop the update, but a permanent one
//! (a 4xx from the apiserver, a validation failure) must surface at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    /// Whether the operation that produced this error may be retried
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

impl Retryable for kube::Error {
    fn is_retryable(&self) -> bool {
        !matches!(self, kube::Error::Api(ae) if (400..500).contains(&ae.code))
    }
}

/// Backoff policy
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (always at least one)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out
///
/// The last error is returned unchanged so callers can still match on it.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !e.is_retryable() {
            debug!(operation = %operation_name, attempt, error = %e, "permanent failure, not retrying");
            return Err(e);
        }
        if attempt >= max_attempts {
            warn!(operation = %operation_name, attempt, error = %e, "giving up after max attempts");
            return Err(e);
        }

        // 0.5x to 1.5x jitter so peers do not retry in lockstep
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = sleep_for.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }
}
