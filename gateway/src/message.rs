//! Messages a gateway produces.

use conveyor_core::event::{Event, EventError, Metadata, SerializedEvent};
use conveyor_core::stream::StreamId;
use serde::Serialize;

/// Metadata key linking a produced message to the event it came from.
pub const CAUSATION_ID: &str = "causation_id";

/// One message routed to a destination.
///
/// `metadata` is merged into the message's own metadata when produced, so
/// the transform can annotate messages without rebuilding them. `options`
/// is handed to the producer as is.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayMessage<O> {
    /// Destination stream or topic.
    pub destination: StreamId,
    /// The message to produce.
    pub message: SerializedEvent,
    /// Extra metadata for this message.
    pub metadata: Metadata,
    /// Producer options.
    pub options: O,
}

impl<O> GatewayMessage<O> {
    /// Route `message` to `destination`.
    #[must_use]
    pub fn new(destination: impl Into<StreamId>, message: SerializedEvent, options: O) -> Self {
        Self {
            destination: destination.into(),
            message,
            metadata: Metadata::new(),
            options,
        }
    }

    /// Serialize `event` and route it to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the event does not serialize.
    pub fn from_event<T>(
        destination: impl Into<StreamId>,
        event: &T,
        options: O,
    ) -> Result<Self, EventError>
    where
        T: Event + Serialize,
    {
        Ok(Self::new(destination, SerializedEvent::from_event(event)?, options))
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The message as it goes to the producer: gateway metadata merged in,
    /// and `causation_id` set unless the transform already set one.
    #[must_use]
    pub(crate) fn into_produced(self, causation_id: &str) -> (StreamId, SerializedEvent, O) {
        let mut message = self.message;
        message.metadata.extend(self.metadata);
        message
            .metadata
            .entry(CAUSATION_ID.to_string())
            .or_insert_with(|| causation_id.to_string());
        (self.destination, message, self.options)
    }
}
