//! Route-and-transform: which messages an event turns into, and where they go.

use crate::message::GatewayMessage;
use conveyor_core::envelope::EventEnvelope;
use std::sync::Arc;

/// Maps one event to the messages to produce. An empty result means the
/// gateway ignores the event.
pub type RouteAndTransform<E, O> =
    Arc<dyn Fn(&EventEnvelope<E>) -> Vec<GatewayMessage<O>> + Send + Sync>;

/// Struct-based route-and-transform, for transforms that carry state.
///
/// # Example
///
/// ```
/// use conveyor_core::envelope::EventEnvelope;
/// use conveyor_gateway::{GatewayMessage, GatewayTransform};
///
/// struct Forward {
///     destination: String,
/// }
///
/// impl GatewayTransform<String, ()> for Forward {
///     fn route_and_transform(&self, envelope: &EventEnvelope<String>) -> Vec<GatewayMessage<()>> {
///         let message = conveyor_core::event::SerializedEvent::new(
///             envelope.event_type.clone(),
///             envelope.event.clone().into_bytes(),
///             envelope.metadata.clone(),
///         );
///         vec![GatewayMessage::new(self.destination.as_str(), message, ())]
///     }
/// }
/// ```
pub trait GatewayTransform<E, O>: Send + Sync {
    /// Map one event to the messages to produce.
    fn route_and_transform(&self, envelope: &EventEnvelope<E>) -> Vec<GatewayMessage<O>>;
}

/// Turn a [`GatewayTransform`] into a [`RouteAndTransform`].
#[must_use]
pub fn from_transform<E, O, T>(transform: T) -> RouteAndTransform<E, O>
where
    E: 'static,
    O: 'static,
    T: GatewayTransform<E, O> + 'static,
{
    Arc::new(move |envelope: &EventEnvelope<E>| transform.route_and_transform(envelope))
}

/// Wrap a closure as a [`RouteAndTransform`].
#[must_use]
pub fn from_fn<E, O, F>(transform: F) -> RouteAndTransform<E, O>
where
    F: Fn(&EventEnvelope<E>) -> Vec<GatewayMessage<O>> + Send + Sync + 'static,
{
    Arc::new(transform)
}
