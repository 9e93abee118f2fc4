//! Producer wrapper used by gateways.

use conveyor_core::event::SerializedEvent;
use conveyor_core::producer::{EventProducer, ProduceError};
use conveyor_core::stream::StreamId;
use conveyor_runtime::metrics::GatewayMetrics;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default time to wait for the inner producer to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wraps the producer a gateway writes to.
///
/// Before the first produce it waits, up to a timeout, for the inner
/// producer to report ready; once it did, later calls go straight through.
/// Produced batches are counted per destination.
pub struct GatewayProducer<O> {
    inner: Arc<dyn EventProducer<O>>,
    ready_timeout: Duration,
    ready: AtomicBool,
}

impl<O> GatewayProducer<O>
where
    O: Send + 'static,
{
    /// Wrap `inner` with the default readiness timeout.
    #[must_use]
    pub fn new(inner: Arc<dyn EventProducer<O>>) -> Self {
        Self {
            inner,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ready: AtomicBool::new(false),
        }
    }

    /// Set how long to wait for the inner producer to become ready.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Wait until the inner producer is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::NotReady`] if it is not ready within the
    /// timeout.
    pub async fn wait_until_ready(&self) -> Result<(), ProduceError> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            if self.inner.is_ready().await {
                self.ready.store(true, Ordering::Release);
                tracing::debug!("Gateway producer ready");
                return Ok(());
            }
            if started.elapsed() >= self.ready_timeout {
                return Err(ProduceError::NotReady(self.ready_timeout));
            }
            tracing::debug!("Waiting for gateway producer to become ready");
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

impl<O> EventProducer<O> for GatewayProducer<O>
where
    O: Send + 'static,
{
    fn produce(
        &self,
        destination: StreamId,
        messages: Vec<SerializedEvent>,
        options: O,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProduceError>> + Send + '_>> {
        Box::pin(async move {
            self.wait_until_ready().await?;

            let count = messages.len();
            let result = self.inner.produce(destination.clone(), messages, options).await;
            match &result {
                Ok(()) => {
                    GatewayMetrics::record_produced(destination.as_str(), count);
                    tracing::debug!(destination = %destination, count, "Produced gateway messages");
                }
                Err(error) => {
                    tracing::warn!(destination = %destination, count, error = %error, "Gateway produce failed");
                }
            }
            result
        })
    }

    fn is_ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        self.inner.is_ready()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use conveyor_core::event::Metadata;
    use conveyor_testing::InMemoryProducer;

    fn message() -> SerializedEvent {
        SerializedEvent::new("Out.v1".to_string(), vec![], Metadata::new())
    }

    #[tokio::test]
    async fn produces_through_when_ready() {
        let inner = InMemoryProducer::<()>::new();
        let producer = GatewayProducer::new(Arc::new(inner.clone()));

        producer
            .produce(StreamId::new("out"), vec![message()], ())
            .await
            .expect("produce");
        assert_eq!(inner.produced().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_never_ready() {
        let inner = InMemoryProducer::<()>::new();
        inner.set_ready(false);
        let producer =
            GatewayProducer::new(Arc::new(inner.clone())).with_ready_timeout(Duration::from_secs(1));

        let result = producer.produce(StreamId::new("out"), vec![message()], ()).await;

        assert_eq!(result, Err(ProduceError::NotReady(Duration::from_secs(1))));
        assert_eq!(inner.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_readiness() {
        let inner = InMemoryProducer::<()>::new();
        inner.set_ready(false);
        let producer = Arc::new(GatewayProducer::new(Arc::new(inner.clone())));

        let waiting = Arc::clone(&producer);
        let call = tokio::spawn(async move {
            waiting.produce(StreamId::new("out"), vec![message()], ()).await
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(inner.produced().is_empty());
        inner.set_ready(true);

        assert_eq!(call.await.expect("join"), Ok(()));
        assert_eq!(inner.produced().len(), 1);
    }
}
