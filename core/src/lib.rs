//! # Conveyor Core
//!
//! Core traits and types for Conveyor event subscriptions.
//!
//! A subscription reads an ordered [event log](event_log::EventLog), decodes
//! each event through an explicit [type map](event::EventTypeMap), hands it to
//! its [handlers](handler::EventHandler) one at a time and records its
//! progress in a [checkpoint store](checkpoint::CheckpointStore). Two handler
//! families are built on top of these traits:
//!
//! - **Projections** turn events into [operations](projection::Operation) on
//!   a [document store](projection::DocumentStore).
//! - **Gateways** route and transform events into messages for an
//!   [event producer](producer::EventProducer).
//!
//! ## Delivery guarantees
//!
//! - At-least-once: an event may be handled more than once after a crash or
//!   retry, never skipped.
//! - Ordered: within one subscription, events are handled in log order and
//!   one at a time.
//! - Checkpoints only move forward, except through an explicit reset.
//!
//! The loop that enforces these lives in `conveyor-runtime`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

/// Checkpoint type and the checkpoint store trait
pub mod checkpoint;

/// Decoded event envelope delivered to handlers
pub mod envelope;

/// Event trait, wire representation and type registry
pub mod event;

/// Event log read trait
pub mod event_log;

/// Event handler trait
pub mod handler;

/// Producer trait for gateways
pub mod producer;

/// Projection operations and document store trait
pub mod projection;

/// Stream identifiers and positions
pub mod stream;

/// Environment module - injected dependencies
pub mod environment;

/// Convenient imports for handler and subscription authors.
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
    pub use crate::envelope::EventEnvelope;
    pub use crate::environment::{Clock, SystemClock};
    pub use crate::event::{Event, EventError, EventTypeMap, RecordedEvent, SerializedEvent};
    pub use crate::event_log::{EventLog, LogError, RecordStream};
    pub use crate::handler::{EventHandler, HandleFuture, HandlerError, HandlingStatus};
    pub use crate::producer::{EventProducer, ProduceError};
    pub use crate::projection::{
        DocumentFilter, DocumentStore, DocumentStoreExt, DocumentUpdate, Operation,
        ProjectedDocument, ProjectionError,
    };
    pub use crate::stream::{Position, StreamId, SubscriptionTarget};
}
