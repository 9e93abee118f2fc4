//! Event trait, wire representation and the event type registry.
//!
//! Events represent facts about things that have happened in the past and are
//! immutable. On the wire and in the log they travel as [`SerializedEvent`]s:
//! a stable event type discriminator plus `bincode` bytes. Subscriptions turn
//! them back into domain events through an explicit [`EventTypeMap`] built at
//! startup, keyed by the discriminator.
//!
//! # Example
//!
//! ```
//! use conveyor_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum OrderEvent {
//!     OrderPlaced { order_id: String, total: f64 },
//!     OrderShipped { order_id: String, tracking: String },
//! }
//!
//! impl Event for OrderEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::OrderPlaced { .. } => "OrderPlaced.v1",
//!             OrderEvent::OrderShipped { .. } => "OrderShipped.v1",
//!         }
//!     }
//! }
//! ```

use crate::stream::{Position, StreamId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A domain event that can be appended to a stream and delivered to handlers.
///
/// The `event_type()` method must return a stable string identifier that
/// includes a version number (`"OrderPlaced.v1"`). It is the key used by
/// [`EventTypeMap`] and by projection rules.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes cannot be deserialized
    /// into this event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// String metadata attached to an event (correlation id, causation id, ...).
pub type Metadata = BTreeMap<String, String>;

/// A serialized event: the unit that is appended, read and produced.
///
/// Metadata is a flat string map so that the whole struct stays `bincode`
/// friendly and can be used as a broker payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "OrderPlaced.v1").
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Event metadata.
    ///
    /// Common metadata fields:
    /// - `correlation_id`: Links related events across streams
    /// - `causation_id`: Links cause-and-effect events
    pub metadata: Metadata,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(event_type: String, data: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from a domain event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use conveyor_core::event::{Event, SerializedEvent};
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # enum OrderEvent {
    /// #     OrderPlaced { order_id: String },
    /// # }
    /// # impl Event for OrderEvent {
    /// #     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
    /// # }
    ///
    /// let event = OrderEvent::OrderPlaced {
    ///     order_id: "order-123".to_string(),
    /// };
    ///
    /// let serialized = SerializedEvent::from_event(&event).unwrap();
    /// assert_eq!(serialized.event_type, "OrderPlaced.v1");
    /// ```
    pub fn from_event<E: Event + Serialize>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata: Metadata::new(),
        })
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// An event as read back from the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Stream the event was appended to.
    pub stream_id: StreamId,

    /// Revision of the event within its stream.
    pub position: Position,

    /// Position in the global log, if the log keeps one.
    pub global_position: Option<Position>,

    /// When the event was appended.
    pub created: DateTime<Utc>,

    /// The serialized event.
    pub event: SerializedEvent,
}

impl RecordedEvent {
    /// Event type of the recorded event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}

type DecodeFn<E> = Arc<dyn Fn(&[u8]) -> Result<E, EventError> + Send + Sync>;

/// Result of looking a serialized event up in an [`EventTypeMap`].
#[derive(Debug)]
pub enum Decoded<E> {
    /// The event type is registered and the payload decoded.
    Event(E),
    /// The event type is not registered; nobody in this process cares about it.
    Unknown,
}

/// Explicit registration table from event type discriminator to decoder.
///
/// Built once at startup. Event types that are not registered are reported
/// as [`Decoded::Unknown`] without touching the payload. A payload that fails
/// to decode for a *registered* type is an error.
///
/// # Example
///
/// ```
/// use conveyor_core::event::{Decoded, Event, EventTypeMap, SerializedEvent};
/// # use serde::{Serialize, Deserialize};
/// # #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// # enum OrderEvent { OrderPlaced { order_id: String } }
/// # impl Event for OrderEvent {
/// #     fn event_type(&self) -> &'static str { "OrderPlaced.v1" }
/// # }
///
/// let types = EventTypeMap::<OrderEvent>::new().register("OrderPlaced.v1");
///
/// let placed = OrderEvent::OrderPlaced { order_id: "1".into() };
/// let serialized = SerializedEvent::from_event(&placed).unwrap();
/// assert!(matches!(types.decode(&serialized), Ok(Decoded::Event(_))));
/// ```
pub struct EventTypeMap<E> {
    decoders: HashMap<String, DecodeFn<E>>,
    fallback: Option<DecodeFn<E>>,
}

impl<E> EventTypeMap<E>
where
    E: Event + DeserializeOwned,
{
    /// Create an empty map. Nothing decodes until types are registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
            fallback: None,
        }
    }

    /// Create a map that decodes every event type with `E::from_bytes`.
    #[must_use]
    pub fn any() -> Self {
        Self {
            decoders: HashMap::new(),
            fallback: Some(Arc::new(E::from_bytes)),
        }
    }

    /// Register an event type decoded with `E::from_bytes`.
    #[must_use]
    pub fn register(self, event_type: impl Into<String>) -> Self {
        self.register_with(event_type, E::from_bytes)
    }

    /// Register an event type with a custom decoder.
    #[must_use]
    pub fn register_with<F>(mut self, event_type: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(&[u8]) -> Result<E, EventError> + Send + Sync + 'static,
    {
        self.decoders.insert(event_type.into(), Arc::new(decoder));
        self
    }

    /// Returns true if the event type decodes with this map.
    #[must_use]
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.fallback.is_some() || self.decoders.contains_key(event_type)
    }

    /// Decode a serialized event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the type is registered
    /// but the payload does not decode.
    pub fn decode(&self, event: &SerializedEvent) -> Result<Decoded<E>, EventError> {
        let decoder = self
            .decoders
            .get(&event.event_type)
            .or(self.fallback.as_ref());

        match decoder {
            Some(decode) => decode(&event.data).map(Decoded::Event),
            None => Ok(Decoded::Unknown),
        }
    }
}

impl<E> Default for EventTypeMap<E>
where
    E: Event + DeserializeOwned,
{
    fn default() -> Self {
        Self::any()
    }
}

impl<E> Clone for EventTypeMap<E> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<E> fmt::Debug for EventTypeMap<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventTypeMap")
            .field("types", &types)
            .field("decode_any", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum TestEvent {
        Created { id: String, value: i32 },
        Updated { id: String, new_value: i32 },
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "TestEvent.Created.v1",
                TestEvent::Updated { .. } => "TestEvent.Updated.v1",
            }
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn serialized_event_from_event_keeps_type_and_metadata() {
        let event = TestEvent::Updated {
            id: "test-1".to_string(),
            new_value: 100,
        };

        let serialized = SerializedEvent::from_event(&event)
            .expect("serialization should succeed")
            .with_metadata("correlation_id", "corr-456");

        assert_eq!(serialized.event_type, "TestEvent.Updated.v1");
        assert!(!serialized.data.is_empty());
        assert_eq!(
            serialized.metadata.get("correlation_id").map(String::as_str),
            Some("corr-456")
        );
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn serialized_event_is_a_valid_wire_payload() {
        let serialized = SerializedEvent::from_event(&TestEvent::Created {
            id: "a".into(),
            value: 1,
        })
        .expect("serialize")
        .with_metadata("k", "v");

        let bytes = bincode::serialize(&serialized).expect("wire encode");
        let back: SerializedEvent = bincode::deserialize(&bytes).expect("wire decode");
        assert_eq!(back, serialized);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn type_map_reports_unregistered_types_as_unknown() {
        let types = EventTypeMap::<TestEvent>::new().register("TestEvent.Created.v1");
        let updated = SerializedEvent::from_event(&TestEvent::Updated {
            id: "x".into(),
            new_value: 2,
        })
        .expect("serialize");

        assert!(!types.is_registered("TestEvent.Updated.v1"));
        assert!(matches!(types.decode(&updated), Ok(Decoded::Unknown)));
    }

    #[test]
    fn type_map_fails_on_corrupt_payload_of_registered_type() {
        let types = EventTypeMap::<TestEvent>::new().register("TestEvent.Created.v1");
        let corrupt = SerializedEvent::new("TestEvent.Created.v1".into(), vec![0xFF], Metadata::new());

        assert!(matches!(
            types.decode(&corrupt),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn any_map_decodes_every_type() {
        let types = EventTypeMap::<TestEvent>::any();
        let event = TestEvent::Created {
            id: "x".into(),
            value: 7,
        };
        let serialized = SerializedEvent::from_event(&event).expect("serialize");

        match types.decode(&serialized).expect("decode") {
            Decoded::Event(decoded) => assert_eq!(decoded, event),
            Decoded::Unknown => unreachable!("any() decodes everything"),
        }
    }
}
