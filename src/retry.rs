//! Retry logic with exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// Delays between attempts
    #[must_use]
    pub fn create_backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
            .build()
    }
}

/// Execute a future with retry logic.
///
/// `f` is retried while `is_retryable` accepts its error and attempts remain.
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable.
pub async fn with_retry<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    name: &str,
    is_retryable: R,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    if !policy.enabled {
        return f().await;
    }

    let mut backoff = policy.create_backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                if let Some(duration) = backoff.next() {
                    debug!(
                        operation = name,
                        attempt = attempts,
                        delay_ms = duration.as_millis(),
                        error = %e,
                        "Retrying after backoff"
                    );
                    sleep(duration).await;
                } else {
                    debug!(
                        operation = name,
                        attempts = attempts,
                        "Max retry attempts reached"
                    );
                    return Err(e);
                }
            }
        }
    }
}
