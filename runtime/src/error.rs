//! Errors surfaced by subscriptions.

use crate::config::ConfigError;
use conveyor_core::checkpoint::CheckpointError;
use conveyor_core::stream::{DisplayPosition, Position};
use thiserror::Error;

/// Errors that cross the subscription boundary.
///
/// Transient failures are retried inside the delivery loop and never show up
/// here; only construction errors and faults do.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    /// The subscription was built without a required piece.
    #[error("Invalid subscription configuration: {0}")]
    Configuration(String),

    /// The tuning configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Checkpoint store failure outside of the delivery loop.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The delivery loop gave up.
    #[error("Subscription '{subscription}' faulted at {}: {reason}", show(.position))]
    Faulted {
        /// Subscription id.
        subscription: String,
        /// Position it could not get past.
        position: Option<Position>,
        /// Why.
        reason: String,
    },

    /// The delivery task panicked or was aborted.
    #[error("Subscription task failed: {0}")]
    Join(String),
}

#[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
const fn show(position: &Option<Position>) -> DisplayPosition {
    DisplayPosition(*position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faulted_renders_sentinel_position() {
        let error = SubscriptionError::Faulted {
            subscription: "orders".into(),
            position: None,
            reason: "checkpoint store unreachable".into(),
        };
        assert_eq!(
            error.to_string(),
            "Subscription 'orders' faulted at none: checkpoint store unreachable"
        );
    }
}
