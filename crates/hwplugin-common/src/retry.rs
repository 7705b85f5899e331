//! Retry with exponential backoff
//!
//! Used for startup work that must eventually succeed (CRD installation)
//! and for bounded delivery attempts (status callbacks). Jitter is on by
//! default so replicas restarting together do not hammer the API server
//! in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
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

    /// Fixed doubling schedule without jitter: 1x, 2x, 4x ... of `initial`
    pub fn doubling(attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: initial,
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation with exponential backoff, retrying every error.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, operation, |_| true).await
}

/// Execute an async operation with exponential backoff while `should_retry`
/// accepts the error.
///
/// Returns the first success, the first error `should_retry` rejects, or the
/// last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            warn!(operation = %operation_name, attempt, error = %e, "Operation failed permanently");
            return Err(e);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        let mut delay = config.delay_after(attempt);
        if config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            delay = Duration::from_secs_f64(delay.as_secs_f64() * factor);
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}
