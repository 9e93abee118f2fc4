//! Checkpoints: how far a subscription has durably got.
//!
//! A checkpoint is `(subscription id, last confirmed position)`. There is one
//! checkpoint per subscription id, shared by every replica that runs the
//! subscription. Stores arbitrate concurrent writers by position value, never
//! by call order: a stored position never goes down except through an
//! explicit [`CheckpointStore::reset`].
//!
//! # Persistence layout
//!
//! ```text
//! { subscription_id: string, position: u64 | "none", updated_at: timestamp }
//! ```
//!
//! # Implementations
//!
//! - `PostgresCheckpointStore` (in `conveyor-projections`): durable, atomic upsert
//! - `InMemoryCheckpointStore` (in `conveyor-testing`): fast, deterministic tests

use crate::stream::{DisplayPosition, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error type for checkpoint operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    /// The backing store could not be reached.
    #[error("Checkpoint store unavailable: {0}")]
    Connection(String),

    /// The backing store rejected or failed the operation.
    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    /// Subscription ids must be non-empty.
    #[error("Invalid subscription id: {0:?}")]
    InvalidSubscriptionId(String),
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Last confirmed position of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stable identifier of the logical consumer.
    pub subscription_id: String,

    /// Last fully processed position; `None` means nothing processed yet.
    pub position: Option<Position>,

    /// When the checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A checkpoint at `position`.
    #[must_use]
    pub fn new(
        subscription_id: impl Into<String>,
        position: Option<Position>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            position,
            updated_at,
        }
    }

    /// The start-of-stream checkpoint for a subscription.
    ///
    /// ```
    /// use conveyor_core::checkpoint::Checkpoint;
    /// use chrono::Utc;
    ///
    /// let start = Checkpoint::start("projections", Utc::now());
    /// assert!(start.is_start());
    /// ```
    #[must_use]
    pub fn start(subscription_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self::new(subscription_id, None, updated_at)
    }

    /// Returns true if nothing has been processed yet.
    #[must_use]
    pub const fn is_start(&self) -> bool {
        self.position.is_none()
    }

    /// Returns the checkpoint that wins when `self` is stored over `other`.
    ///
    /// Higher positions win; on a tie the most recent write is kept.
    #[must_use]
    pub fn max_by_position(self, other: Self) -> Self {
        if self.position >= other.position { self } else { other }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.subscription_id,
            DisplayPosition(self.position)
        )
    }
}

/// Validates a subscription identifier.
///
/// # Errors
///
/// Returns [`CheckpointError::InvalidSubscriptionId`] for empty or blank ids.
pub fn validate_subscription_id(subscription_id: &str) -> Result<()> {
    if subscription_id.trim().is_empty() {
        return Err(CheckpointError::InvalidSubscriptionId(
            subscription_id.to_string(),
        ));
    }
    Ok(())
}

/// Persists and retrieves checkpoints.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so stores can be shared as
/// `Arc<dyn CheckpointStore>` between subscriptions.
pub trait CheckpointStore: Send + Sync {
    /// Load the last stored checkpoint.
    ///
    /// Returns the start-of-stream checkpoint when none was stored yet.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] when the store cannot be read. A missing
    /// connection is an error, never an empty default.
    fn get_last(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>>;

    /// Store a checkpoint.
    ///
    /// With `force = false` the store may coalesce rapid updates; with
    /// `force = true` the write must be durable before the future resolves.
    /// A write lower than the stored position is ignored. Returns the
    /// checkpoint that is stored once the call completes.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the write fails.
    fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>>;

    /// Reset a subscription to the start of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the reset fails.
    fn reset(&self, subscription_id: &str)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
