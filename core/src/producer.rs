//! Producing serialized events to destination streams.
//!
//! An [`EventProducer`] is what a gateway hands its routed messages to. The
//! destination is a stream or topic name; `options` carries whatever the
//! concrete producer needs per call (partition key, headers, ...).
//!
//! # Delivery
//!
//! Producers are at-least-once: a produce that returned `Ok` is durable on the
//! destination, a produce that failed may or may not have landed. Consumers
//! downstream deduplicate.
//!
//! # Implementations
//!
//! - `InMemoryProducer` (in `conveyor-testing` crate): records messages, optional latency
//! - `RedpandaProducer` (in `conveyor-redpanda` crate): Kafka-compatible broker

use crate::event::SerializedEvent;
use crate::stream::StreamId;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while producing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProduceError {
    /// Failed to connect to the destination.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to produce to a destination.
    #[error("Produce failed for destination '{destination}': {reason}")]
    ProduceFailed {
        /// The destination that failed.
        destination: String,
        /// The reason for failure.
        reason: String,
    },

    /// The producer did not become ready in time.
    #[error("Producer not ready after {0:?}")]
    NotReady(std::time::Duration),

    /// Failed to serialize a message for the wire.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

impl ProduceError {
    /// Build a [`ProduceError::ProduceFailed`].
    #[must_use]
    pub fn failed(destination: &StreamId, reason: impl Into<String>) -> Self {
        Self::ProduceFailed {
            destination: destination.to_string(),
            reason: reason.into(),
        }
    }
}

/// Produces batches of serialized events to a destination.
///
/// `O` is the per-call option type of the concrete producer; producers that
/// need none use `()`.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so producers can be shared as
/// `Arc<dyn EventProducer<O>>`.
pub trait EventProducer<O>: Send + Sync {
    /// Produce `messages` to `destination`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError`] if any message could not be produced. Messages
    /// before the failing one may already have landed.
    fn produce(
        &self,
        destination: StreamId,
        messages: Vec<SerializedEvent>,
        options: O,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProduceError>> + Send + '_>>;

    /// Returns true once the producer can accept messages.
    fn is_ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_failed_names_destination() {
        let error = ProduceError::failed(&StreamId::new("integration-orders"), "broker down");
        assert_eq!(
            error.to_string(),
            "Produce failed for destination 'integration-orders': broker down"
        );
    }
}
