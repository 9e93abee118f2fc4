//! The decoded event handed to handlers.

use crate::event::{Metadata, RecordedEvent};
use crate::event_log::LogError;
use crate::stream::{Position, StreamId, SubscriptionTarget};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// A decoded event plus where it came from.
///
/// Created by the subscription for one delivery and dropped once every
/// handler has finished with it. Handlers only ever see it by reference.
///
/// The cancellation token is the subscription's stop signal. Long-running
/// handlers may race their remaining work against it; nothing forces them to.
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    /// The decoded domain event.
    pub event: E,

    /// Event type discriminator the event was registered under.
    pub event_type: String,

    /// Stream the event belongs to.
    pub stream_id: StreamId,

    /// Revision of the event within its stream.
    pub stream_position: Position,

    /// Position in the global log, if the log keeps one.
    pub global_position: Option<Position>,

    /// Metadata carried with the event.
    pub metadata: Metadata,

    /// When the event was appended.
    pub created: DateTime<Utc>,

    /// Identifier of the subscription delivering the event.
    pub subscription_id: String,

    /// Stop signal of the delivering subscription.
    pub cancellation: CancellationToken,

    position: Position,
}

impl<E> EventEnvelope<E> {
    /// Build an envelope for a recorded event delivered by `subscription_id`.
    ///
    /// The envelope's [`position`](Self::position) is the one the
    /// subscription checkpoints: the stream revision for a single-stream
    /// target, the global position for `$all`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Malformed`] for a `$all` target when the record
    /// carries no global position.
    pub fn new(
        event: E,
        record: &RecordedEvent,
        target: &SubscriptionTarget,
        subscription_id: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Result<Self, LogError> {
        let position = checkpoint_position(record, target)?;
        Ok(Self {
            event,
            event_type: record.event.event_type.clone(),
            stream_id: record.stream_id.clone(),
            stream_position: record.position,
            global_position: record.global_position,
            metadata: record.event.metadata.clone(),
            created: record.created,
            subscription_id: subscription_id.into(),
            cancellation,
            position,
        })
    }

    /// Position used for checkpointing and for stamping projected documents.
    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    /// Returns true if the delivering subscription was asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Map the payload, keeping the delivery context.
    #[must_use]
    pub fn map<T>(self, f: impl FnOnce(E) -> T) -> EventEnvelope<T> {
        EventEnvelope {
            event: f(self.event),
            event_type: self.event_type,
            stream_id: self.stream_id,
            stream_position: self.stream_position,
            global_position: self.global_position,
            metadata: self.metadata,
            created: self.created,
            subscription_id: self.subscription_id,
            cancellation: self.cancellation,
            position: self.position,
        }
    }
}

/// The position a subscription over `target` checkpoints for `record`.
///
/// # Errors
///
/// Returns [`LogError::Malformed`] when a `$all` record has no global
/// position. Stream revisions of different streams collide, so they cannot
/// stand in for it.
pub fn checkpoint_position(
    record: &RecordedEvent,
    target: &SubscriptionTarget,
) -> Result<Position, LogError> {
    match target {
        SubscriptionTarget::Stream(_) => Ok(record.position),
        SubscriptionTarget::All => record.global_position.ok_or_else(|| {
            LogError::Malformed(format!(
                "{}@{} has no global position",
                record.stream_id, record.position
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::event::SerializedEvent;

    fn record(position: u64, global: Option<u64>) -> RecordedEvent {
        RecordedEvent {
            stream_id: StreamId::new("S"),
            position: Position::new(position),
            global_position: global.map(Position::new),
            created: Utc::now(),
            event: SerializedEvent::new("T.v1".into(), vec![], Metadata::new())
                .with_metadata("correlation_id", "c-1"),
        }
    }

    #[test]
    fn stream_target_checkpoints_stream_revision() {
        let envelope = EventEnvelope::new(
            (),
            &record(3, Some(42)),
            &SubscriptionTarget::stream("S"),
            "sub",
            CancellationToken::new(),
        )
        .expect("stream record");
        assert_eq!(envelope.position(), Position::new(3));
        assert_eq!(envelope.metadata.get("correlation_id").map(String::as_str), Some("c-1"));
    }

    #[test]
    fn all_target_checkpoints_global_position() {
        let envelope = EventEnvelope::new(
            (),
            &record(3, Some(42)),
            &SubscriptionTarget::All,
            "sub",
            CancellationToken::new(),
        )
        .expect("global record");
        assert_eq!(envelope.position(), Position::new(42));
    }

    #[test]
    fn all_target_rejects_record_without_global_position() {
        let error = checkpoint_position(&record(3, None), &SubscriptionTarget::All);
        assert!(matches!(error, Err(LogError::Malformed(_))));
        assert_eq!(
            checkpoint_position(&record(3, None), &SubscriptionTarget::stream("S")),
            Ok(Position::new(3))
        );
    }

    #[test]
    fn map_keeps_context() {
        let envelope = EventEnvelope::new(
            1_u32,
            &record(5, Some(50)),
            &SubscriptionTarget::All,
            "sub",
            CancellationToken::new(),
        )
        .expect("global record")
        .map(|n| n + 1);
        assert_eq!(envelope.event, 2);
        assert_eq!(envelope.position(), Position::new(50));
        assert_eq!(envelope.subscription_id, "sub");
    }
}
