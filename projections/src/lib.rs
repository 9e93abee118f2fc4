//! Projections for Conveyor.
//!
//! # Overview
//!
//! This crate turns events into read models:
//! - **[`ProjectionHandler`]**: an event handler that resolves each event to
//!   an [`Operation`](conveyor_core::projection::Operation) and executes it
//!   against a document store
//! - **[`ProjectionRules`]**: event-type keyed registration table, the usual
//!   way to write a projector
//! - **`PostgreSQL`**: JSONB document store and checkpoint store
//!
//! # Building Projections
//!
//! ```ignore
//! use conveyor_projections::{PostgresDocumentStore, ProjectionHandler, ProjectionRules};
//! use conveyor_runtime::Subscription;
//!
//! let summaries = Arc::new(PostgresDocumentStore::new(pool.clone(), "order_summaries")?);
//! let rules = ProjectionRules::new().on("OrderPlaced.v1", |envelope: &EventEnvelope<OrderEvent>| {
//!     Operation::update_by_id(envelope.stream_id.as_str(), DocumentUpdate::new().set("status", "placed"))
//! });
//!
//! let handle = Subscription::<OrderEvent>::builder("order-summaries")
//!     .event_log(log)
//!     .checkpoint_store(Arc::new(PostgresCheckpointStore::new(pool)))
//!     .handler(Arc::new(ProjectionHandler::from_rules("order-summaries", rules, summaries)))
//!     .build()?
//!     .start();
//! ```

pub mod handler;
pub mod postgres;

// Re-export main types for convenience
pub use handler::{ProjectionHandler, ProjectionRules, Projector};
pub use postgres::{PostgresCheckpointStore, PostgresDocumentStore};
