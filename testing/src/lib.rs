//! # Conveyor Testing
//!
//! Testing utilities for Conveyor subscriptions and their handlers.
//!
//! This crate provides:
//! - In-memory implementations of every core collaborator trait
//!   ([`InMemoryEventLog`], [`InMemoryCheckpointStore`],
//!   [`InMemoryDocumentStore`], [`InMemoryProducer`])
//! - A [`RecordingHandler`] that records what it saw and fails on demand
//! - A deterministic [`FixedClock`]
//! - proptest strategies in [`properties`]
//!
//! Every mock can inject failures, so retry and fault paths are tested
//! without a broker or a database.
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_testing::{InMemoryCheckpointStore, InMemoryEventLog, RecordingHandler};
//! use conveyor_runtime::Subscription;
//!
//! #[tokio::test]
//! async fn test_delivery() {
//!     let log = InMemoryEventLog::new();
//!     let checkpoints = InMemoryCheckpointStore::new();
//!     let handler = Arc::new(RecordingHandler::new("recorder"));
//!
//!     log.append_event("order-1", &OrderEvent::Placed { .. })?;
//!
//!     let handle = Subscription::<OrderEvent>::builder("orders")
//!         .event_log(Arc::new(log.clone()))
//!         .checkpoint_store(Arc::new(checkpoints.clone()))
//!         .handler(handler.clone())
//!         .build()?
//!         .start();
//!
//!     handler.wait_for_calls(1, Duration::from_secs(1)).await;
//!     handle.stop().await?;
//!     assert_eq!(checkpoints.position("orders"), Some(Position::new(0)));
//! }
//! ```

use chrono::{DateTime, Utc};
use conveyor_core::environment::Clock;
use thiserror::Error;

/// In-memory checkpoint store
pub mod checkpoint;

/// In-memory document store
pub mod document_store;

/// In-memory event log with a live tail
pub mod event_log;

/// Recording handler with failure injection
pub mod handler;

/// Recording producer
pub mod producer;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until moved with [`advance`](Self::advance).
    /// Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use conveyor_testing::mocks::FixedClock;
    /// use conveyor_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut time) = self.time.write() {
                *time += by;
            }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time.read().map_or_else(|poisoned| *poisoned.into_inner(), |time| *time)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use conveyor_core::stream::Position;
    use proptest::prelude::*;

    /// Any position up to `max`.
    pub fn position(max: u64) -> impl Strategy<Value = Position> {
        (0..=max).prop_map(Position::new)
    }

    /// A sequence of checkpoint writes: an optional position and the force
    /// flag, in arbitrary order.
    pub fn checkpoint_writes(
        max_position: u64,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<(Option<Position>, bool)>> {
        prop::collection::vec(
            (prop::option::weighted(0.9, position(max_position)), any::<bool>()),
            1..=max_len,
        )
    }

    /// Handler failure plans: how many times a handler fails before it
    /// succeeds, never more than `max`.
    pub fn transient_failures(max: usize) -> impl Strategy<Value = usize> {
        0..=max
    }
}

/// Error message carried by every injected failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("injected failure: {0}")]
pub struct InjectedFailure(pub String);

impl InjectedFailure {
    /// Create an injected failure with a short description.
    #[must_use]
    pub fn new(what: impl Into<String>) -> Self {
        Self(what.into())
    }
}

/// Install a `tracing` subscriber for test output.
///
/// Honors `RUST_LOG`, defaults to `debug` for the conveyor crates. Safe to
/// call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("conveyor_runtime=debug,conveyor_projections=debug,conveyor_gateway=debug")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use checkpoint::InMemoryCheckpointStore;
pub use document_store::InMemoryDocumentStore;
pub use event_log::InMemoryEventLog;
pub use handler::{HandledCall, Journal, RecordingHandler};
pub use mocks::{FixedClock, test_clock};
pub use producer::{InMemoryProducer, ProducedMessage};
