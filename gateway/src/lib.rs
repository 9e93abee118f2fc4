//! Gateways for Conveyor.
//!
//! A gateway is a subscription whose handler forwards events somewhere else:
//! another stream, a broker topic, an integration partner. For every event a
//! route-and-transform function decides which messages to produce and where;
//! the [`GatewayHandler`] hands them to an
//! [`EventProducer`](conveyor_core::producer::EventProducer).
//!
//! - **[`Gateway::builder`]**: builds the subscription and its handler
//! - **[`GatewayMessage`]**: one routed message with producer options
//! - **[`GatewayTransform`]**: struct-based route-and-transform
//! - **[`GatewayProducer`]**: readiness wait, logging and metrics around a producer
//!
//! # Example
//!
//! ```ignore
//! use conveyor_gateway::{Gateway, GatewayMessage};
//!
//! let handle = Gateway::builder::<OrderEvent, RedpandaProduceOptions>("order-integration")
//!     .event_log(log)
//!     .checkpoint_store(checkpoints)
//!     .producer(Arc::new(producer))
//!     .route_and_transform(|envelope: &EventEnvelope<OrderEvent>| match &envelope.event {
//!         OrderEvent::Placed { .. } => GatewayMessage::from_event(
//!             "integration-orders",
//!             &OrderPlacedV1::from(&envelope.event),
//!             RedpandaProduceOptions::keyed(envelope.stream_id.as_str()),
//!         )
//!         .into_iter()
//!         .collect(),
//!         _ => Vec::new(),
//!     })
//!     .build()?
//!     .start();
//! ```

pub mod gateway;
pub mod handler;
pub mod message;
pub mod producer;
pub mod transform;

pub use gateway::{Gateway, GatewayBuilder};
pub use handler::{DEFAULT_QUEUE_CAPACITY, GatewayHandler};
pub use message::{CAUSATION_ID, GatewayMessage};
pub use producer::GatewayProducer;
pub use transform::{GatewayTransform, RouteAndTransform, from_fn, from_transform};
