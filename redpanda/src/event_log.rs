//! Reading a stream back from a Redpanda topic.

use chrono::{DateTime, Utc};
use conveyor_core::event::{RecordedEvent, SerializedEvent};
use conveyor_core::event_log::{EventLog, LogError, RecordStream};
use conveyor_core::stream::{DisplayPosition, Position, StreamId, SubscriptionTarget};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;

const PARTITION: i32 = 0;
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Event log over Redpanda topics, one topic per stream.
///
/// A stream target is read from partition 0 of the topic named after the
/// stream; the partition offset is the stream position. Only single-stream
/// targets are served: a topic has no global order across streams.
///
/// Offsets are never committed to the broker. The subscription's checkpoint
/// store is the only record of progress, and every subscribe assigns the
/// partition at `from + 1` explicitly.
pub struct RedpandaEventLog {
    brokers: String,
    consumer_group: String,
    buffer_size: usize,
}

impl RedpandaEventLog {
    /// Create an event log reading from `brokers`.
    #[must_use]
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            consumer_group: "conveyor".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Consumer group id used for the underlying consumers.
    #[must_use]
    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    /// Records buffered between the consumer and the subscription.
    /// Zero is raised to one.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn consumer(&self, target: &SubscriptionTarget, from: Option<Position>) -> Result<StreamConsumer, LogError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| LogError::subscription_failed(target, from, format!("Failed to create consumer: {e}")))
    }
}

/// Partition offset of the first record after `from`.
pub(crate) fn start_offset(from: Option<Position>) -> Result<i64, LogError> {
    let start = Position::resume_after(from).value();
    i64::try_from(start).map_err(|_| LogError::Malformed(format!("position {start} is out of offset range")))
}

/// Decode one partition record.
pub(crate) fn to_record(
    stream_id: &StreamId,
    offset: i64,
    timestamp_millis: Option<i64>,
    payload: Option<&[u8]>,
) -> Result<RecordedEvent, LogError> {
    let position = u64::try_from(offset)
        .map_err(|_| LogError::Malformed(format!("negative offset {offset} on {stream_id}")))?;
    let payload = payload.ok_or_else(|| LogError::Malformed(format!("record {offset} on {stream_id} has no payload")))?;
    let event: SerializedEvent = bincode::deserialize(payload)
        .map_err(|e| LogError::Malformed(format!("record {offset} on {stream_id}: {e}")))?;
    let created = timestamp_millis
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(RecordedEvent {
        stream_id: stream_id.clone(),
        position: Position::new(position),
        global_position: None,
        created,
        event,
    })
}

impl EventLog for RedpandaEventLog {
    fn subscribe(
        &self,
        target: SubscriptionTarget,
        from: Option<Position>,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, LogError>> + Send + '_>> {
        Box::pin(async move {
            let SubscriptionTarget::Stream(stream_id) = &target else {
                return Err(LogError::UnsupportedTarget(format!(
                    "{target}: Redpanda topics have no global order"
                )));
            };

            let offset = start_offset(from)?;
            let consumer = self.consumer(&target, from)?;
            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(stream_id.as_str(), PARTITION, Offset::Offset(offset))
                .map_err(|e| LogError::subscription_failed(&target, from, e.to_string()))?;
            consumer
                .assign(&assignment)
                .map_err(|e| LogError::subscription_failed(&target, from, e.to_string()))?;

            tracing::info!(
                topic = %stream_id,
                partition = PARTITION,
                offset,
                from = %DisplayPosition(from),
                "Assigned topic partition"
            );

            let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
            let stream_id = stream_id.clone();

            // The task owns the consumer and ends when the receiver is dropped
            // or the consumer fails.
            tokio::spawn(async move {
                let mut messages = consumer.stream();
                while let Some(next) = messages.next().await {
                    let (item, fatal) = match next {
                        Ok(message) => {
                            let record = to_record(
                                &stream_id,
                                message.offset(),
                                message.timestamp().to_millis(),
                                message.payload(),
                            );
                            if let Ok(record) = &record {
                                tracing::trace!(
                                    topic = %stream_id,
                                    offset = message.offset(),
                                    event_type = %record.event_type(),
                                    "Received record"
                                );
                            }
                            let fatal = record.is_err();
                            (record, fatal)
                        }
                        Err(e) => (Err(LogError::Dropped(format!("consumer error: {e}"))), true),
                    };

                    if tx.send(item).await.is_err() || fatal {
                        break;
                    }
                }
                tracing::debug!(topic = %stream_id, "Consumer task exiting");
            });

            let records = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(records) as RecordStream)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use conveyor_core::event::Metadata;

    #[test]
    fn starts_after_the_checkpoint() {
        assert_eq!(start_offset(None).unwrap(), 0);
        assert_eq!(start_offset(Some(Position::new(41))).unwrap(), 42);
    }

    #[test]
    fn decodes_partition_records() {
        let event = SerializedEvent::new("Placed.v1".to_string(), vec![1, 2], Metadata::new());
        let payload = bincode::serialize(&event).unwrap();

        let record = to_record(&StreamId::new("orders"), 7, Some(1_700_000_000_000), Some(&payload)).unwrap();

        assert_eq!(record.position, Position::new(7));
        assert_eq!(record.global_position, None);
        assert_eq!(record.event, event);
        assert_eq!(record.created.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn rejects_records_without_payload() {
        let result = to_record(&StreamId::new("orders"), 0, None, None);
        assert!(matches!(result, Err(LogError::Malformed(_))));
    }

    #[tokio::test]
    async fn all_target_is_unsupported() {
        let log = RedpandaEventLog::new("localhost:9092");
        let result = log.subscribe(SubscriptionTarget::All, None).await;
        assert!(matches!(result, Err(LogError::UnsupportedTarget(_))));
    }
}
