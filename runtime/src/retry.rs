//! Retry logic with exponential backoff for handling transient failures.
//!
//! This module provides utilities for retrying operations that may fail due to transient
//! errors (network issues, a checkpoint store restarting, a handler whose downstream is
//! briefly unavailable).
//!
//! Every wait between attempts races the subscription's [`CancellationToken`], so a
//! stopping subscription never sits out a long backoff.
//!
//! # Example
//!
//! ```rust
//! use conveyor_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let cancel = CancellationToken::new();
//! let result = retry_with_backoff(&policy, &cancel, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Scale each delay by a random factor in `0.5..=1.0`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: false,
        }
    }

    /// Calculate delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: delay = `initial_delay` * (multiplier ^ attempt)
    /// Capped at `max_delay`, then scaled by jitter when enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        // Exponents past 64 are capped by max_delay anyway.
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let exponent = attempt.min(64) as i32;
        let base_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            use rand::Rng;
            capped_secs * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs.max(0.0))
    }

    /// Check if another retry is allowed after `attempt` failed attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_retries
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retry forever.
    #[must_use]
    pub const fn unbounded(mut self) -> Self {
        self.max_retries = Some(usize::MAX);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Randomise delays to spread out replicas retrying together.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter,
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// Every allowed attempt failed.
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: usize,
        /// The last error.
        error: E,
    },

    /// The error was not worth retrying.
    #[error("not retryable: {0}")]
    Permanent(E),

    /// Cancellation was requested while waiting to retry.
    #[error("cancelled while retrying: {0}")]
    Cancelled(E),
}

impl<E> RetryError<E> {
    /// The error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { error, .. } | Self::Permanent(error) | Self::Cancelled(error) => {
                error
            }
        }
    }

    /// Returns true if cancellation ended the retries.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` if cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancel.cancelled() => false,
    }
}

/// Retry an async operation with exponential backoff.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `cancel` - Stops waiting between attempts
/// * `operation` - Async operation to retry (must be `FnMut` to allow multiple calls)
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last error if all retries are
/// exhausted, or [`RetryError::Cancelled`] if `cancel` fired during a backoff.
///
/// # Example
///
/// ```rust
/// use conveyor_runtime::retry::{RetryPolicy, retry_with_backoff};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(&policy, &CancellationToken::new(), || async {
///     // Simulated fallible operation
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_with_predicate(policy, cancel, operation, |_| true).await
}

/// Retry an async operation with custom retry logic.
///
/// This function allows you to provide a predicate to determine whether
/// an error is retryable.
///
/// # Errors
///
/// As [`retry_with_backoff`], plus [`RetryError::Permanent`] for errors the
/// predicate rejects.
///
/// # Example
///
/// ```rust
/// use conveyor_runtime::retry::{RetryPolicy, retry_with_predicate};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_predicate(
///     &policy,
///     &CancellationToken::new(),
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(RetryError::Permanent(err));
                }

                if !policy.should_retry(attempt) {
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        error: err,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying..."
                );

                if !sleep_or_cancel(delay, cancel).await {
                    return Err(RetryError::Cancelled(err));
                }
                attempt += 1;
            }
        }
    }
}
