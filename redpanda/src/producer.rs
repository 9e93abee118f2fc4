//! Producing gateway messages to Redpanda topics.

use conveyor_core::event::SerializedEvent;
use conveyor_core::producer::{EventProducer, ProduceError};
use conveyor_core::stream::StreamId;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call options for [`RedpandaProducer`].
///
/// `key` picks the partition; messages with the same key keep their order.
/// Without a key the destination name is used, so every message of one
/// destination lands on one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedpandaProduceOptions {
    /// Partition key.
    pub key: Option<String>,
    /// Kafka record headers.
    pub headers: BTreeMap<String, String>,
}

impl RedpandaProduceOptions {
    /// Options with a partition key.
    #[must_use]
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            headers: BTreeMap::new(),
        }
    }

    /// Add a record header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.headers.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_str()),
                })
            })
    }
}

/// Redpanda (Kafka-compatible) producer.
///
/// Each message is a bincode-encoded [`SerializedEvent`]; the destination is
/// the topic. Messages of one call are sent one after another, so a failure
/// leaves the earlier ones produced and the later ones not.
///
/// # Example
///
/// ```no_run
/// use conveyor_redpanda::RedpandaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = RedpandaProducer::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaProducer {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
}

impl RedpandaProducer {
    /// Create a producer with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::ConnectionFailed`] if the client cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, ProduceError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a producer.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    async fn send(
        &self,
        topic: &StreamId,
        message: &SerializedEvent,
        options: &RedpandaProduceOptions,
    ) -> Result<(), ProduceError> {
        let payload = bincode::serialize(message)
            .map_err(|e| ProduceError::SerializationFailed(e.to_string()))?;
        let key = options.key.as_deref().unwrap_or_else(|| topic.as_str());

        let record = FutureRecord::to(topic.as_str())
            .payload(&payload)
            .key(key)
            .headers(options.headers());

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    partition,
                    offset,
                    event_type = %message.event_type,
                    "Message produced"
                );
                Ok(())
            }
            Err((kafka_error, _)) => {
                tracing::error!(topic = %topic, error = %kafka_error, "Failed to produce message");
                Err(ProduceError::failed(topic, kafka_error.to_string()))
            }
        }
    }
}

impl EventProducer<RedpandaProduceOptions> for RedpandaProducer {
    fn produce(
        &self,
        destination: StreamId,
        messages: Vec<SerializedEvent>,
        options: RedpandaProduceOptions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProduceError>> + Send + '_>> {
        Box::pin(async move {
            for message in &messages {
                self.send(&destination, message, &options).await?;
            }
            Ok(())
        })
    }

    fn is_ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            // Metadata fetches block the calling thread.
            tokio::task::spawn_blocking(move || {
                producer
                    .client()
                    .fetch_metadata(None, Timeout::After(timeout))
                    .is_ok()
            })
            .await
            .unwrap_or(false)
        })
    }
}

/// Builder for [`RedpandaProducer`].
#[derive(Default)]
pub struct RedpandaProducerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    idempotence: bool,
}

impl RedpandaProducerBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Acknowledgement mode: "0", "1" or "all". Default: "all".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    /// Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable the idempotent producer, so broker-side retries cannot
    /// duplicate or reorder messages. Requires `acks = all`.
    #[must_use]
    pub const fn idempotence(mut self, enabled: bool) -> Self {
        self.idempotence = enabled;
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::ConnectionFailed`] if brokers are not set or
    /// the client rejects the configuration.
    pub fn build(self) -> Result<RedpandaProducer, ProduceError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ProduceError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .set("enable.idempotence", self.idempotence.to_string())
            .create()
            .map_err(|e| ProduceError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            idempotence = self.idempotence,
            "Redpanda producer created"
        );

        Ok(RedpandaProducer {
            producer,
            brokers,
            timeout,
        })
    }
}
