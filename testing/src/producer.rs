//! Recording producer for gateway tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::InjectedFailure;
use conveyor_core::event::SerializedEvent;
use conveyor_core::producer::{EventProducer, ProduceError};
use conveyor_core::stream::StreamId;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// One message handed to the producer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducedMessage<O> {
    /// Destination stream or topic.
    pub destination: StreamId,
    /// The message.
    pub message: SerializedEvent,
    /// Options passed with the produce call.
    pub options: O,
}

#[derive(Debug)]
struct Inner<O> {
    produced: RwLock<Vec<ProducedMessage<O>>>,
    latency: RwLock<Duration>,
    failing_calls: AtomicUsize,
    calls: AtomicUsize,
    ready: AtomicBool,
    acknowledged: Notify,
}

/// Producer that keeps everything it was asked to produce.
///
/// A call records its messages only after the configured latency elapsed,
/// which is how tests tell "dispatched" from "acknowledged". Clones share
/// the same record.
///
/// # Example
///
/// ```
/// use conveyor_testing::InMemoryProducer;
/// use conveyor_core::event::SerializedEvent;
/// use conveyor_core::producer::EventProducer;
/// use conveyor_core::stream::StreamId;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = InMemoryProducer::<()>::new();
/// let message = SerializedEvent::new("OrderPlaced.v1".into(), vec![], Default::default());
///
/// producer.produce(StreamId::new("integration"), vec![message], ()).await?;
///
/// assert_eq!(producer.produced().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryProducer<O = ()> {
    inner: Arc<Inner<O>>,
}

impl<O> Clone for InMemoryProducer<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> InMemoryProducer<O>
where
    O: Clone + Send + Sync + 'static,
{
    /// Create a ready producer with no latency
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                produced: RwLock::new(Vec::new()),
                latency: RwLock::new(Duration::ZERO),
                failing_calls: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                ready: AtomicBool::new(true),
                acknowledged: Notify::new(),
            }),
        }
    }

    /// Delay every produce call by `latency` before acknowledging.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the latency of later calls.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.write().unwrap() = latency;
    }

    /// Report ready or not from `is_ready`.
    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
    }

    /// Fail the next `count` produce calls.
    pub fn fail_next_calls(&self, count: usize) {
        self.inner.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Every acknowledged message, in order.
    #[must_use]
    pub fn produced(&self) -> Vec<ProducedMessage<O>> {
        self.inner.produced.read().unwrap().clone()
    }

    /// Acknowledged messages for one destination.
    #[must_use]
    pub fn produced_to(&self, destination: &str) -> Vec<ProducedMessage<O>> {
        self.produced()
            .into_iter()
            .filter(|produced| produced.destination.as_str() == destination)
            .collect()
    }

    /// Produce calls started so far, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages were acknowledged.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let acknowledged = self.inner.acknowledged.notified();
                if self.inner.produced.read().unwrap().len() >= count {
                    return;
                }
                acknowledged.await;
            }
        })
        .await
        .is_ok()
    }
}

impl<O> Default for InMemoryProducer<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<O> EventProducer<O> for InMemoryProducer<O>
where
    O: Clone + Send + Sync + 'static,
{
    fn produce(
        &self,
        destination: StreamId,
        messages: Vec<SerializedEvent>,
        options: O,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProduceError>> + Send + '_>> {
        Box::pin(async move {
            self.inner.calls.fetch_add(1, Ordering::SeqCst);

            let latency = *self.inner.latency.read().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            if self
                .inner
                .failing_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProduceError::failed(
                    &destination,
                    InjectedFailure::new("broker rejected the batch").to_string(),
                ));
            }

            self.inner
                .produced
                .write()
                .unwrap()
                .extend(messages.into_iter().map(|message| ProducedMessage {
                    destination: destination.clone(),
                    message,
                    options: options.clone(),
                }));
            self.inner.acknowledged.notify_waiters();
            Ok(())
        })
    }

    fn is_ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move { self.inner.ready.load(Ordering::SeqCst) })
    }
}
