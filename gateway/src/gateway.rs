//! Gateway factory: a subscription whose only handler forwards events.

use crate::handler::{DEFAULT_QUEUE_CAPACITY, GatewayHandler};
use crate::message::GatewayMessage;
use crate::producer::{DEFAULT_READY_TIMEOUT, GatewayProducer};
use crate::transform::{GatewayTransform, RouteAndTransform, from_fn, from_transform};
use conveyor_core::checkpoint::CheckpointStore;
use conveyor_core::envelope::EventEnvelope;
use conveyor_core::environment::Clock;
use conveyor_core::event::{Event, EventTypeMap};
use conveyor_core::event_log::EventLog;
use conveyor_core::producer::EventProducer;
use conveyor_core::stream::SubscriptionTarget;
use conveyor_runtime::config::SubscriptionConfig;
use conveyor_runtime::error::SubscriptionError;
use conveyor_runtime::subscription::{Subscription, SubscriptionBuilder};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for building gateways.
///
/// # Example
///
/// ```rust,ignore
/// let gateway = Gateway::builder::<OrderEvent, RedpandaProduceOptions>("order-integration")
///     .event_log(log)
///     .checkpoint_store(checkpoints)
///     .producer(Arc::new(redpanda))
///     .route_and_transform(|envelope| vec![/* ... */])
///     .build()?;
///
/// let handle = gateway.start();
/// ```
pub struct Gateway;

impl Gateway {
    /// Start building a gateway subscription with the given id.
    #[must_use]
    pub fn builder<E, O>(subscription_id: impl Into<String>) -> GatewayBuilder<E, O>
    where
        E: Event + DeserializeOwned + Send + Sync + 'static,
        O: PartialEq + Send + 'static,
    {
        let id = subscription_id.into();
        GatewayBuilder {
            subscription: Subscription::builder(id.clone()),
            name: id,
            producer: None,
            transform: None,
            await_produce: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Builder for a gateway [`Subscription`].
///
/// Collaborators shared with plain subscriptions (log, checkpoints, target,
/// config, clock) are passed through. A producer and a route-and-transform
/// are required.
pub struct GatewayBuilder<E, O> {
    subscription: SubscriptionBuilder<E>,
    name: String,
    producer: Option<Arc<dyn EventProducer<O>>>,
    transform: Option<RouteAndTransform<E, O>>,
    await_produce: bool,
    queue_capacity: usize,
    ready_timeout: Duration,
}

impl<E, O> GatewayBuilder<E, O>
where
    E: Event + DeserializeOwned + Send + Sync + 'static,
    O: PartialEq + Send + 'static,
{
    /// What to read. Defaults to the whole log.
    #[must_use]
    pub fn target(mut self, target: SubscriptionTarget) -> Self {
        self.subscription = self.subscription.target(target);
        self
    }

    /// The log to read from.
    #[must_use]
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.subscription = self.subscription.event_log(log);
        self
    }

    /// Where progress is stored.
    #[must_use]
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.subscription = self.subscription.checkpoint_store(store);
        self
    }

    /// Event types this gateway decodes.
    #[must_use]
    pub fn type_map(mut self, types: EventTypeMap<E>) -> Self {
        self.subscription = self.subscription.type_map(types);
        self
    }

    /// Subscription tuning.
    #[must_use]
    pub fn config(mut self, config: SubscriptionConfig) -> Self {
        self.subscription = self.subscription.config(config);
        self
    }

    /// Clock for checkpoint timestamps and lag.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.subscription = self.subscription.clock(clock);
        self
    }

    /// The producer messages go to.
    #[must_use]
    pub fn producer(mut self, producer: Arc<dyn EventProducer<O>>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Route and transform with a closure.
    #[must_use]
    pub fn route_and_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&EventEnvelope<E>) -> Vec<GatewayMessage<O>> + Send + Sync + 'static,
    {
        self.transform = Some(from_fn(transform));
        self
    }

    /// Route and transform with a [`GatewayTransform`] implementation.
    #[must_use]
    pub fn transform<T>(mut self, transform: T) -> Self
    where
        T: GatewayTransform<E, O> + 'static,
    {
        self.transform = Some(from_transform(transform));
        self
    }

    /// Whether to wait for produce acknowledgements before moving on.
    /// Defaults to `true`.
    #[must_use]
    pub const fn await_produce(mut self, await_produce: bool) -> Self {
        self.await_produce = await_produce;
        self
    }

    /// Events queued for background produce before the subscription waits
    /// for the producer. Only used with `await_produce(false)`.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// How long the first produce waits for the producer to become ready.
    #[must_use]
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Build the gateway subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Configuration`] if the producer or the
    /// transform is missing, or anything [`SubscriptionBuilder::build`]
    /// rejects.
    pub fn build(self) -> Result<Subscription<E>, SubscriptionError> {
        let producer = self
            .producer
            .ok_or_else(|| SubscriptionError::Configuration("a gateway producer is required".into()))?;
        let transform = self.transform.ok_or_else(|| {
            SubscriptionError::Configuration("a route-and-transform is required".into())
        })?;

        let producer = Arc::new(GatewayProducer::new(producer).with_ready_timeout(self.ready_timeout));
        let handler = GatewayHandler::new(self.name, producer, transform, self.await_produce)
            .with_queue_capacity(self.queue_capacity);

        self.subscription.handler(Arc::new(handler)).build()
    }
}
