//! Retry with exponential backoff for store round trips
//!
//! Store connectivity failures are retried at the client layer with bounded
//! exponential backoff and jitter; semantic failures surface immediately.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Initial backoff duration
    #[serde(rename = "initial_backoff_ms", with = "crate::config::duration_ms")]
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    #[serde(rename = "max_backoff_ms", with = "crate::config::duration_ms")]
    pub max_backoff: Duration,

    /// Backoff multiplier (typically 2.0 for exponential backoff)
    pub multiplier: f64,

    /// Add random jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Short backoff for tests and local stores
    pub fn quick() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Calculate backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let final_duration = if self.jitter {
            // Add 0-25% jitter
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(final_duration)
    }
}

/// Pseudo-random jitter in `0.0..1.0` taken from a fresh v4 uuid
fn rand_jitter() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u64;
    (bits % 1000) as f64 / 1000.0
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry after a specific duration (e.g., from Retry-After header)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    /// Determine if this error should be retried
    fn retry_decision(&self) -> RetryDecision;
}

/// Execute an async operation with retry logic
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `config.max_retries` retries are used up.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let decision = e.retry_decision();

                if decision == RetryDecision::NoRetry {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation failed with non-retryable error: {}",
                        e
                    );
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Operation failed after {} attempts: {}",
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }

                let backoff = match decision {
                    RetryDecision::RetryAfter(d) => d.min(config.max_backoff),
                    _ => config.backoff_duration(attempt),
                };

                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore::StoreError;

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(5), Duration::from_secs(1)); // Capped
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: true,
            ..Default::default()
        };

        let backoff = config.backoff_duration(0);
        assert!(backoff >= Duration::from_secs(1));
        assert!(backoff <= Duration::from_millis(1250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_error_retried() {
        let config = RetryConfig::quick();
        let mut attempts = 0;

        let result: Result<&str, StoreError> = with_retry(&config, "xadd", || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(StoreError::Transport("connection reset".into()))
                } else {
                    Ok("1-0")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("1-0"));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let config = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let mut attempts = 0;

        let result: Result<(), StoreError> = with_retry(&config, "get", || {
            attempts += 1;
            async { Err(StoreError::Timeout("5s".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_no_retry_on_semantic_error() {
        let config = RetryConfig::quick();
        let mut attempts = 0;

        let result: Result<(), StoreError> = with_retry(&config, "xreadgroup", || {
            attempts += 1;
            async {
                Err(StoreError::NoGroup {
                    stream: "stream:head".into(),
                    group: "workers".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
