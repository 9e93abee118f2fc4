//! Subscription configuration.
//!
//! Provides defaults, `with_*` overrides, validation and environment loading
//! for [`SubscriptionConfig`].
//!
//! # Environment variables
//!
//! | Variable | Field | Unit |
//! |---|---|---|
//! | `CONVEYOR_CHECKPOINT_BATCH_SIZE` | `checkpoint_batch_size` | events |
//! | `CONVEYOR_CHECKPOINT_INTERVAL_MS` | `checkpoint_interval` | milliseconds |
//! | `CONVEYOR_HANDLER_MAX_RETRIES` | `handler_retry.max_retries` | attempts |
//! | `CONVEYOR_RETRY_INITIAL_DELAY_MS` | initial delay of every retry policy | milliseconds |
//! | `CONVEYOR_RETRY_MAX_DELAY_MS` | max delay of every retry policy | milliseconds |
//! | `CONVEYOR_FAIL_FAST` | `fault_action` (`true` terminates the process) | bool |
//!
//! Unset variables keep their defaults.
//!
//! # Example
//!
//! ```no_run
//! use conveyor_runtime::config::SubscriptionConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SubscriptionConfig::from_env()?;
//! println!("Checkpoint every {} events", config.checkpoint_batch_size);
//! # Ok(())
//! # }
//! ```

use crate::retry::RetryPolicy;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse an environment variable.
    #[error("Failed to parse {var}={value:?}: {reason}")]
    ParseError {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// What a subscription does once it faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultAction {
    /// Stop the loop, report `Faulted` and keep the host process alive.
    #[default]
    ReportUnhealthy,
    /// Log and exit the process with code 1 so an orchestrator restarts it.
    TerminateProcess,
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReportUnhealthy => write!(f, "report-unhealthy"),
            Self::TerminateProcess => write!(f, "terminate-process"),
        }
    }
}

/// Tuning knobs of a subscription.
///
/// # Defaults
///
/// - `checkpoint_batch_size`: 100 events
/// - `checkpoint_interval`: 5 seconds
/// - `handler_retry`: 3 retries, 100ms doubling up to 5s
/// - `checkpoint_retry`: 5 retries, 100ms doubling up to 5s
/// - `resubscribe_retry`: unbounded, 500ms doubling up to 30s, jittered
/// - `fault_action`: [`FaultAction::ReportUnhealthy`]
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    /// Persist the checkpoint after this many handled events.
    pub checkpoint_batch_size: usize,
    /// Persist the checkpoint when this much time passed since the last commit.
    pub checkpoint_interval: Duration,
    /// Retries of a failing handler for one event before faulting.
    pub handler_retry: RetryPolicy,
    /// Retries of checkpoint loads and writes before faulting.
    pub checkpoint_retry: RetryPolicy,
    /// Backoff between attempts to re-open a dropped log subscription.
    pub resubscribe_retry: RetryPolicy,
    /// What to do when the subscription faults.
    pub fault_action: FaultAction,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            checkpoint_batch_size: 100,
            checkpoint_interval: Duration::from_secs(5),
            handler_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
            checkpoint_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
            resubscribe_retry: RetryPolicy::builder()
                .unbounded()
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .jitter(true)
                .build(),
            fault_action: FaultAction::ReportUnhealthy,
        }
    }
}

impl SubscriptionConfig {
    /// Load the defaults overridden by `CONVEYOR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable does not parse or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load the defaults overridden by values from `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) = parse_var::<usize, _>(&lookup, "CONVEYOR_CHECKPOINT_BATCH_SIZE")? {
            config.checkpoint_batch_size = size;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CONVEYOR_CHECKPOINT_INTERVAL_MS")? {
            config.checkpoint_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var::<usize, _>(&lookup, "CONVEYOR_HANDLER_MAX_RETRIES")? {
            config.handler_retry.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CONVEYOR_RETRY_INITIAL_DELAY_MS")? {
            let delay = Duration::from_millis(ms);
            config.handler_retry.initial_delay = delay;
            config.checkpoint_retry.initial_delay = delay;
            config.resubscribe_retry.initial_delay = delay;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CONVEYOR_RETRY_MAX_DELAY_MS")? {
            let delay = Duration::from_millis(ms);
            config.handler_retry.max_delay = delay;
            config.checkpoint_retry.max_delay = delay;
            config.resubscribe_retry.max_delay = delay;
        }
        if let Some(fail_fast) = parse_var::<bool, _>(&lookup, "CONVEYOR_FAIL_FAST")? {
            config.fault_action = if fail_fast {
                FaultAction::TerminateProcess
            } else {
                FaultAction::ReportUnhealthy
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "checkpoint_batch_size must be > 0".to_string(),
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "checkpoint_interval must be > 0".to_string(),
            ));
        }
        for (name, policy) in [
            ("handler_retry", &self.handler_retry),
            ("checkpoint_retry", &self.checkpoint_retry),
            ("resubscribe_retry", &self.resubscribe_retry),
        ] {
            if policy.initial_delay > policy.max_delay {
                return Err(ConfigError::ValidationError(format!(
                    "{name}: initial_delay must not exceed max_delay"
                )));
            }
            if policy.multiplier < 1.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}: multiplier must be >= 1.0"
                )));
            }
        }
        Ok(())
    }

    /// Set the checkpoint batch size.
    #[must_use]
    pub const fn with_checkpoint_batch_size(mut self, size: usize) -> Self {
        self.checkpoint_batch_size = size;
        self
    }

    /// Set the checkpoint interval.
    #[must_use]
    pub const fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the handler retry policy.
    #[must_use]
    pub fn with_handler_retry(mut self, policy: RetryPolicy) -> Self {
        self.handler_retry = policy;
        self
    }

    /// Set the checkpoint retry policy.
    #[must_use]
    pub fn with_checkpoint_retry(mut self, policy: RetryPolicy) -> Self {
        self.checkpoint_retry = policy;
        self
    }

    /// Set the resubscribe backoff policy.
    #[must_use]
    pub fn with_resubscribe_retry(mut self, policy: RetryPolicy) -> Self {
        self.resubscribe_retry = policy;
        self
    }

    /// Set the fault action.
    #[must_use]
    pub const fn with_fault_action(mut self, action: FaultAction) -> Self {
        self.fault_action = action;
        self
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::ParseError {
                var: var.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
