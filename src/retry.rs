//! Retry utilities with exponential backoff and jitter.
//!
//! Used by the status reconciler for transient store errors (timeouts,
//! version conflicts that survive a re-fetch). Backoff is jittered to avoid
//! synchronized retry storms when many objects conflict at once.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_STATUS_RETRY_ATTEMPTS,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Jittered delay for the given zero-based attempt number.
    ///
    /// Exponential in the attempt, capped at `max_delay`, scaled by a
    /// random factor in 0.5..1.5.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Execute an async operation with bounded exponential backoff and jitter.
///
/// Returns the operation's result, or the last error once `max_attempts`
/// is exhausted. The caller decides whether exhaustion is fatal; for status
/// writes it never is (the next rebuild cycle retries naturally).
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "operation failed after max retries, giving up"
                    );
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
