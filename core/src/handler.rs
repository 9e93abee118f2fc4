//! Event handlers: the units a subscription fans each event out to.

use crate::envelope::EventEnvelope;
use crate::event::EventError;
use crate::producer::ProduceError;
use crate::projection::ProjectionError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingStatus {
    /// The handler acted on the event.
    Handled,
    /// The handler had nothing to do for the event.
    Ignored,
}

impl HandlingStatus {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Ignored => "ignored",
        }
    }
}

/// Why a handler failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Handler-specific failure.
    #[error("Handler '{handler}' failed: {reason}")]
    Failed {
        /// Name of the failing handler.
        handler: String,
        /// The reason for failure.
        reason: String,
    },

    /// The event payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] EventError),

    /// A document or projection store call failed.
    #[error(transparent)]
    Store(#[from] ProjectionError),

    /// A produce call failed.
    #[error(transparent)]
    Produce(#[from] ProduceError),

    /// The handler gave up because the subscription is stopping.
    #[error("Handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Build a [`HandlerError::Failed`].
    #[must_use]
    pub fn failed(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

/// Future returned by [`EventHandler::handle`].
pub type HandleFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HandlingStatus, HandlerError>> + Send + 'a>>;

/// Consumes decoded events on behalf of a subscription.
///
/// A subscription calls its handlers one after another, in registration
/// order, for every event, and waits for each call to finish before the next
/// handler or event. A handler therefore never sees two events at once from
/// the same subscription, but it may see the same event more than once after
/// a crash or retry and must be idempotent.
///
/// # Dyn Compatibility
///
/// Handlers are stored as `Arc<dyn EventHandler<E>>`.
pub trait EventHandler<E>: Send + Sync {
    /// Name used in logs, metrics and errors.
    fn name(&self) -> &str;

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the event could not be handled. The
    /// subscription retries the call and eventually faults.
    fn handle<'a>(&'a self, envelope: &'a EventEnvelope<E>) -> HandleFuture<'a>;
}

impl<E, H> EventHandler<E> for Arc<H>
where
    H: EventHandler<E> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn handle<'a>(&'a self, envelope: &'a EventEnvelope<E>) -> HandleFuture<'a> {
        (**self).handle(envelope)
    }
}
