//! # Bounded Retry
//!
//! One combinator family for every asynchronous-activation case in the
//! provisioning path: retrying a cloud call that failed transiently, and
//! polling for an external state transition (OIDC issuer activation, workload
//! readiness).
//!
//! Both are bounded by a fixed attempt count. Exhausting the attempts never
//! loops forever: [`retry`] returns the last error, [`poll_until`] returns
//! [`PollError::Timeout`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vocare_deployer::retry::{poll_until, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::fixed(30, Duration::from_secs(10));
//! let issuer: String = poll_until(&policy, "OIDC issuer", || async {
//!     Ok::<_, std::io::Error>(Some("https://issuer".to_string()))
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Delay policy between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

/// Attempt bound plus delay policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    #[must_use]
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(interval),
        }
    }

    #[must_use]
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// Fixed-interval policy whose attempts cover `timeout`
    #[must_use]
    pub fn within(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = timeout.as_millis().div_ceil(interval_ms) + 1;
        Self::fixed(u32::try_from(attempts).unwrap_or(u32::MAX), interval)
    }

    /// No waiting between attempts; used by tests and dry runs
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Delay to sleep after the given (1-based) failed attempt
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(interval) => *interval,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Failure of a bounded poll
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },
    #[error("error while waiting for {what}: {source}")]
    Failed {
        what: String,
        #[source]
        source: E,
    },
}

/// Retry `operation` while `is_retryable` accepts its error.
///
/// Non-retryable errors are returned immediately; retryable ones are retried
/// until the policy's attempts are exhausted, then the last error is returned.
pub async fn retry<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll `check` until it yields `Some(value)`.
///
/// - `Ok(Some(v))` - condition met, returns `v`
/// - `Ok(None)` - not yet, sleep and poll again
/// - `Err(e)` - fatal, stop immediately
pub async fn poll_until<F, Fut, T, E>(
    policy: &RetryPolicy,
    what: &str,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 1..=policy.max_attempts {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                debug!(attempt = attempt, "Waiting for {}...", what);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
            Err(source) => {
                return Err(PollError::Failed {
                    what: what.to_string(),
                    source,
                })
            }
        }
    }
    Err(PollError::Timeout {
        what: what.to_string(),
        attempts: policy.max_attempts,
    })
}
