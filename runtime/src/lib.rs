//! # Conveyor Runtime
//!
//! The subscription engine for Conveyor.
//!
//! This crate runs [`Subscription`]s: long-lived tasks that read an event
//! log, fan every event out to their handlers in order and keep a checkpoint
//! of how far they got.
//!
//! ## Core Components
//!
//! - **Subscription**: The delivery loop, its builder and its control handle
//! - **Checkpoint Committer**: Batches checkpoint writes (every N events or T elapsed)
//! - **Retry**: Exponential backoff shared by handler, checkpoint and resubscribe retries
//! - **Status & Health**: Operator-visible state on a watch channel
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_runtime::{Subscription, SubscriptionConfig};
//!
//! let handle = Subscription::<OrderEvent>::builder("order-summary")
//!     .event_log(log)
//!     .checkpoint_store(checkpoints)
//!     .handler(projection)
//!     .config(SubscriptionConfig::from_env()?)
//!     .build()?
//!     .start();
//!
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Batched checkpoint commits
pub mod committer;

/// Subscription configuration
pub mod config;

/// Error types surfaced by subscriptions
pub mod error;

/// Prometheus metrics for observability
pub mod metrics;

/// Subscription lifecycle status
pub mod status;

/// The subscription delivery loop
pub mod subscription;

pub use config::{ConfigError, FaultAction, SubscriptionConfig};
pub use error::SubscriptionError;
pub use retry::RetryPolicy;
pub use status::SubscriptionStatus;
pub use subscription::{Subscription, SubscriptionBuilder, SubscriptionHandle};

/// Health check status levels
///
/// Indicates the current health state of a component or system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but not delivering (starting or stopping)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    pub message: Option<String>,

    /// Optional metadata (e.g., faulted position)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Aggregated health report
///
/// Combines the checks of every subscription a host runs.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Report over a set of running subscriptions.
    #[must_use]
    pub fn for_subscriptions<'a>(handles: impl IntoIterator<Item = &'a SubscriptionHandle>) -> Self {
        Self::new(handles.into_iter().map(SubscriptionHandle::health).collect())
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if overall system is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }
}
