//! Operator-visible subscription status.

use crate::HealthCheck;
use conveyor_core::stream::{DisplayPosition, Position};
use std::fmt;

/// Lifecycle state of a subscription.
///
/// Published on a `tokio::sync::watch` channel; observers always see the
/// latest state.
///
/// ```text
/// Starting ──▶ Running ──▶ Stopping ──▶ Stopped
///    │            │
///    └────────────┴──▶ Faulted
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Loading the checkpoint and opening the log.
    Starting,
    /// Delivering events.
    Running,
    /// Stop requested; finishing the in-flight event and the final commit.
    Stopping,
    /// Stopped cleanly.
    Stopped,
    /// Gave up on an event or on the checkpoint store.
    Faulted {
        /// Position the subscription could not get past.
        position: Option<Position>,
        /// Why.
        reason: String,
    },
}

impl SubscriptionStatus {
    /// Returns true for [`SubscriptionStatus::Faulted`].
    #[must_use]
    pub const fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }

    /// Returns true once the delivery loop has exited.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted { .. })
    }

    /// Health check for the subscription named `subscription_id`.
    ///
    /// Running is healthy, transitions are degraded, stopped and faulted are
    /// unhealthy.
    #[must_use]
    pub fn health(&self, subscription_id: &str) -> HealthCheck {
        let component = format!("subscription:{subscription_id}");
        match self {
            Self::Running => HealthCheck::healthy(component),
            Self::Starting | Self::Stopping => HealthCheck::degraded(component, self.to_string()),
            Self::Stopped => HealthCheck::unhealthy(component, "stopped"),
            Self::Faulted { position, reason } => {
                HealthCheck::unhealthy(component, format!("faulted: {reason}"))
                    .with_metadata("position", DisplayPosition(*position).to_string())
            }
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Faulted { position, reason } => {
                write!(f, "faulted at {}: {reason}", DisplayPosition(*position))
            }
        }
    }
}
