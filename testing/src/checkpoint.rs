//! In-memory checkpoint store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::InjectedFailure;
use chrono::{DateTime, Utc};
use conveyor_core::checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, Result, validate_subscription_id,
};
use conveyor_core::stream::Position;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// One call to `store_checkpoint`, as requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointWrite {
    /// Position the caller asked to store.
    pub position: Option<Position>,
    /// Whether the write was forced.
    pub force: bool,
}

/// In-memory checkpoint store for fast, deterministic testing.
///
/// Keeps the highest position per subscription, like a real store must.
/// Every write request is also kept in order so tests can assert on batching
/// and forced commits.
///
/// # Example
///
/// ```
/// use conveyor_testing::InMemoryCheckpointStore;
/// use conveyor_core::checkpoint::{Checkpoint, CheckpointStore};
/// use conveyor_core::stream::Position;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCheckpointStore::new();
///
/// store.store_checkpoint(Checkpoint::new("orders", Some(Position::new(5)), chrono::Utc::now()), false).await?;
/// store.store_checkpoint(Checkpoint::new("orders", Some(Position::new(3)), chrono::Utc::now()), true).await?;
///
/// assert_eq!(store.position("orders"), Some(Position::new(5)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    writes: Arc<RwLock<Vec<CheckpointWrite>>>,
    failing_writes: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCheckpointStore {
    /// Create a new empty checkpoint store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a position directly, bypassing the monotonic check.
    pub fn seed(&self, subscription_id: &str, position: Option<Position>) {
        self.checkpoints.write().unwrap().insert(
            subscription_id.to_string(),
            Checkpoint::new(subscription_id, position, Utc::now()),
        );
    }

    /// Stored position of a subscription; `None` when at the start.
    #[must_use]
    pub fn position(&self, subscription_id: &str) -> Option<Position> {
        self.checkpoints
            .read()
            .unwrap()
            .get(subscription_id)
            .and_then(|checkpoint| checkpoint.position)
    }

    /// Every write request, in call order.
    #[must_use]
    pub fn writes(&self) -> Vec<CheckpointWrite> {
        self.writes.read().unwrap().clone()
    }

    /// Fail the next `count` writes with [`CheckpointError::Storage`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Fail every call with [`CheckpointError::Connection`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CheckpointError::Connection(
                InjectedFailure::new("checkpoint store unavailable").to_string(),
            ));
        }
        Ok(())
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn get_last(
        &self,
        subscription_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>> {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move {
            validate_subscription_id(&subscription_id)?;
            self.check_available()?;

            let stored = self.checkpoints.read().unwrap().get(&subscription_id).cloned();
            Ok(stored.unwrap_or_else(|| Checkpoint::start(subscription_id, DateTime::UNIX_EPOCH)))
        })
    }

    fn store_checkpoint(
        &self,
        checkpoint: Checkpoint,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>> {
        Box::pin(async move {
            validate_subscription_id(&checkpoint.subscription_id)?;
            self.check_available()?;

            self.writes.write().unwrap().push(CheckpointWrite {
                position: checkpoint.position,
                force,
            });
            if self.take_write_failure() {
                return Err(CheckpointError::Storage(
                    InjectedFailure::new("checkpoint write failed").to_string(),
                ));
            }

            let mut checkpoints = self.checkpoints.write().unwrap();
            let stored = match checkpoints.remove(&checkpoint.subscription_id) {
                Some(existing) => checkpoint.max_by_position(existing),
                None => checkpoint,
            };
            checkpoints.insert(stored.subscription_id.clone(), stored.clone());
            Ok(stored)
        })
    }

    fn reset(&self, subscription_id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let subscription_id = subscription_id.to_string();
        Box::pin(async move {
            validate_subscription_id(&subscription_id)?;
            self.check_available()?;

            self.checkpoints.write().unwrap().insert(
                subscription_id.clone(),
                Checkpoint::start(subscription_id, Utc::now()),
            );
            Ok(())
        })
    }
}
