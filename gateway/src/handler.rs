//! The gateway event handler.

use crate::producer::GatewayProducer;
use crate::transform::RouteAndTransform;
use conveyor_core::envelope::EventEnvelope;
use conveyor_core::event::SerializedEvent;
use conveyor_core::handler::{EventHandler, HandleFuture, HandlerError, HandlingStatus};
use conveyor_core::producer::{EventProducer, ProduceError};
use conveyor_core::stream::StreamId;
use futures::future::join_all;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

/// Events a fire-and-forget gateway may queue before `handle` waits.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Messages for one destination and one set of options, produced in one call.
struct Batch<O> {
    destination: StreamId,
    messages: Vec<SerializedEvent>,
    options: O,
}

/// Event handler that forwards events to another destination.
///
/// For each event the transform picks zero or more messages. No messages
/// means the event is `Ignored`. Messages are grouped by destination and
/// then by options, in first-seen order, and each group is produced in one
/// call with its own options. Groups are produced concurrently; one failing
/// group does not stop the others.
///
/// # Acknowledgement
///
/// - `await_produce = true`: the handler returns once every group was
///   acknowledged, and fails if any produce failed. The subscription does
///   not checkpoint past an event whose messages were not acknowledged.
/// - `await_produce = false`: groups go to a bounded queue drained by a
///   background task, and the handler returns `Handled` once the event is
///   queued. The task produces in event order and logs failures. A full
///   queue makes `handle` wait, so at most the queue capacity of
///   checkpointed events can be lost on a crash.
pub struct GatewayHandler<E, O> {
    name: String,
    producer: Arc<GatewayProducer<O>>,
    transform: RouteAndTransform<E, O>,
    await_produce: bool,
    queue_capacity: usize,
    background: OnceLock<mpsc::Sender<Vec<Batch<O>>>>,
}

impl<E, O> GatewayHandler<E, O>
where
    O: PartialEq + Send + 'static,
{
    /// Create a gateway handler.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        producer: Arc<GatewayProducer<O>>,
        transform: RouteAndTransform<E, O>,
        await_produce: bool,
    ) -> Self {
        Self {
            name: name.into(),
            producer,
            transform,
            await_produce,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            background: OnceLock::new(),
        }
    }

    /// How many events the background queue holds (minimum 1). Only used
    /// when produce is not awaited.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Whether the handler waits for produce acknowledgements.
    #[must_use]
    pub const fn awaits_produce(&self) -> bool {
        self.await_produce
    }

    fn batches(&self, envelope: &EventEnvelope<E>) -> Vec<Batch<O>> {
        let causation_id = format!("{}@{}", envelope.stream_id, envelope.stream_position);
        let mut batches: Vec<Batch<O>> = Vec::new();

        for routed in (self.transform)(envelope) {
            let (destination, message, options) = routed.into_produced(&causation_id);
            match batches
                .iter_mut()
                .find(|batch| batch.destination == destination && batch.options == options)
            {
                Some(batch) => batch.messages.push(message),
                None => batches.push(Batch {
                    destination,
                    messages: vec![message],
                    options,
                }),
            }
        }
        batches
    }

    /// Sender of the background produce task, started on first use.
    fn background(&self) -> &mpsc::Sender<Vec<Batch<O>>> {
        self.background.get_or_init(|| {
            let (tx, mut rx) = mpsc::channel::<Vec<Batch<O>>>(self.queue_capacity);
            let producer = Arc::clone(&self.producer);
            let name = self.name.clone();
            tokio::spawn(async move {
                while let Some(batches) = rx.recv().await {
                    for (destination, error) in produce_all(&producer, batches).await {
                        tracing::error!(
                            handler = %name,
                            destination = %destination,
                            error = %error,
                            "Background gateway produce failed, messages may be lost"
                        );
                    }
                }
                tracing::debug!(handler = %name, "Background gateway producer stopped");
            });
            tx
        })
    }
}

/// Produce every batch concurrently and return the failures.
async fn produce_all<O: Send + 'static>(
    producer: &GatewayProducer<O>,
    batches: Vec<Batch<O>>,
) -> Vec<(StreamId, ProduceError)> {
    join_all(batches.into_iter().map(|batch| async move {
        let destination = batch.destination.clone();
        producer
            .produce(batch.destination, batch.messages, batch.options)
            .await
            .err()
            .map(|error| (destination, error))
    }))
    .await
    .into_iter()
    .flatten()
    .collect()
}

impl<E, O> EventHandler<E> for GatewayHandler<E, O>
where
    E: Send + Sync,
    O: PartialEq + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, envelope: &'a EventEnvelope<E>) -> HandleFuture<'a> {
        Box::pin(async move {
            let batches = self.batches(envelope);
            if batches.is_empty() {
                tracing::debug!(
                    handler = %self.name,
                    event_type = %envelope.event_type,
                    position = %envelope.position(),
                    "No messages to produce for event"
                );
                return Ok(HandlingStatus::Ignored);
            }

            tracing::debug!(
                handler = %self.name,
                event_type = %envelope.event_type,
                position = %envelope.position(),
                batches = batches.len(),
                await_produce = self.await_produce,
                "Producing gateway messages"
            );

            if self.await_produce {
                if let Some((_, error)) = produce_all(&self.producer, batches).await.into_iter().next() {
                    return Err(HandlerError::from(error));
                }
                return Ok(HandlingStatus::Handled);
            }

            // A full queue waits for room unless the subscription is stopping.
            tokio::select! {
                biased;
                sent = self.background().send(batches) => {
                    if sent.is_err() {
                        // The worker only exits when the handler is dropped.
                        tracing::error!(handler = %self.name, "Background gateway producer is gone");
                    }
                }
                () = envelope.cancellation.cancelled() => return Err(HandlerError::Cancelled),
            }
            Ok(HandlingStatus::Handled)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::message::{CAUSATION_ID, GatewayMessage};
    use crate::transform::from_fn;
    use chrono::Utc;
    use conveyor_core::CancellationToken;
    use conveyor_core::event::{Metadata, RecordedEvent};
    use conveyor_core::handler::HandlerError;
    use conveyor_core::producer::ProduceError;
    use conveyor_core::stream::{Position, SubscriptionTarget};
    use conveyor_testing::{InMemoryProducer, ProducedMessage};
    use std::time::Duration;

    fn envelope(event: &str) -> EventEnvelope<String> {
        let record = RecordedEvent {
            stream_id: StreamId::new("order-1"),
            position: Position::new(7),
            global_position: Some(Position::new(70)),
            created: Utc::now(),
            event: SerializedEvent::new("Order.v1".to_string(), Vec::new(), Metadata::new()),
        };
        EventEnvelope::new(
            event.to_string(),
            &record,
            &SubscriptionTarget::All,
            "gateway",
            CancellationToken::new(),
        )
        .expect("valid envelope")
    }

    fn fan_out() -> RouteAndTransform<String, String> {
        from_fn(|envelope: &EventEnvelope<String>| {
            if envelope.event == "skip" {
                return Vec::new();
            }
            let message = |tag: u8| SerializedEvent::new("Integration.v1".to_string(), vec![tag], Metadata::new());
            vec![
                GatewayMessage::new("a", message(1), "key-1".to_string()),
                GatewayMessage::new("b", message(2), "key-2".to_string()),
                GatewayMessage::new("a", message(3), "key-1".to_string()),
                GatewayMessage::new("a", message(4), "key-3".to_string()),
            ]
        })
    }

    fn handler(
        inner: &InMemoryProducer<String>,
        await_produce: bool,
    ) -> GatewayHandler<String, String> {
        let producer = Arc::new(GatewayProducer::new(Arc::new(inner.clone())));
        GatewayHandler::new("gateway", producer, fan_out(), await_produce)
    }

    fn tags(produced: &[ProducedMessage<String>]) -> Vec<u8> {
        let mut tags: Vec<u8> = produced.iter().flat_map(|produced| produced.message.data.clone()).collect();
        tags.sort_unstable();
        tags
    }

    #[tokio::test]
    async fn groups_by_destination_and_options() {
        let inner = InMemoryProducer::<String>::new();
        let handler = handler(&inner, true);

        let status = handler.handle(&envelope("go")).await;

        assert_eq!(status, Ok(HandlingStatus::Handled));
        assert_eq!(inner.call_count(), 3);
        let to_a = inner.produced_to("a");
        assert_eq!(tags(&to_a), vec![1, 3, 4]);
        for produced in &to_a {
            let expected = if produced.message.data == vec![4] { "key-3" } else { "key-1" };
            assert_eq!(produced.options, expected);
        }
        let to_b = inner.produced_to("b");
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].options, "key-2");
        assert_eq!(
            to_a[0].message.metadata.get(CAUSATION_ID).map(String::as_str),
            Some("order-1@7")
        );
    }

    #[tokio::test]
    async fn no_messages_is_ignored() {
        let inner = InMemoryProducer::<String>::new();
        let handler = handler(&inner, true);

        let status = handler.handle(&envelope("skip")).await;

        assert_eq!(status, Ok(HandlingStatus::Ignored));
        assert_eq!(inner.call_count(), 0);
    }

    #[tokio::test]
    async fn awaited_failure_fails_the_handler_after_every_group_ran() {
        let inner = InMemoryProducer::<String>::new();
        inner.fail_next_calls(1);
        let handler = handler(&inner, true);

        let status = handler.handle(&envelope("go")).await;

        assert!(matches!(
            status,
            Err(HandlerError::Produce(ProduceError::ProduceFailed { .. }))
        ));
        assert_eq!(inner.call_count(), 3);
        assert_eq!(tags(&inner.produced()), vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_returns_before_acknowledgement() {
        let inner = InMemoryProducer::<String>::new().with_latency(Duration::from_secs(5));
        let handler = handler(&inner, false);

        let status = handler.handle(&envelope("go")).await;

        assert_eq!(status, Ok(HandlingStatus::Handled));
        assert!(inner.produced().is_empty());
        assert!(inner.wait_for_messages(4, Duration::from_secs(6)).await);
    }

    #[tokio::test]
    async fn fire_and_forget_failure_does_not_drop_other_destinations() {
        let inner = InMemoryProducer::<String>::new();
        inner.fail_next_calls(1);
        let handler = handler(&inner, false);

        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));

        assert!(inner.wait_for_messages(2, Duration::from_secs(1)).await);
        assert_eq!(tags(&inner.produced()), vec![2, 4]);
    }

    #[tokio::test]
    async fn fire_and_forget_swallows_failures() {
        let inner = InMemoryProducer::<String>::new();
        inner.fail_next_calls(3);
        let handler = handler(&inner, false);

        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));
        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));
        assert!(inner.wait_for_messages(4, Duration::from_secs(1)).await);
        assert_eq!(inner.call_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_makes_handle_wait() {
        let inner = InMemoryProducer::<String>::new().with_latency(Duration::from_secs(5));
        let handler = handler(&inner, false).with_queue_capacity(1);

        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));
        // The worker takes the first event, the second fills the queue.
        let second = tokio::time::timeout(Duration::from_secs(1), handler.handle(&envelope("go"))).await;
        assert_eq!(second, Ok(Ok(HandlingStatus::Handled)));

        let third = tokio::time::timeout(Duration::from_secs(1), handler.handle(&envelope("go"))).await;
        assert!(third.is_err());

        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));
        assert!(inner.wait_for_messages(12, Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_gives_way_to_stop() {
        let inner = InMemoryProducer::<String>::new().with_latency(Duration::from_secs(5));
        let handler = handler(&inner, false).with_queue_capacity(1);
        let stopping = envelope("go");

        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));
        assert_eq!(handler.handle(&envelope("go")).await, Ok(HandlingStatus::Handled));
        stopping.cancellation.cancel();

        assert_eq!(handler.handle(&stopping).await, Err(HandlerError::Cancelled));
    }
}
