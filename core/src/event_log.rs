//! Read side of the event log.
//!
//! The [`EventLog`] trait is the only thing a subscription needs from the
//! log: open an ordered stream of recorded events starting strictly after a
//! position, serving history first and then new appends as they land.
//!
//! The write side (appending events) belongs to whoever owns the log and is
//! not part of this trait.
//!
//! # Implementations
//!
//! - `InMemoryEventLog` (in `conveyor-testing` crate): catch-up plus broadcast tail
//! - `RedpandaEventLog` (in `conveyor-redpanda` crate): one topic partition per stream
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_core::event_log::EventLog;
//! use conveyor_core::stream::SubscriptionTarget;
//! use futures::StreamExt;
//!
//! let mut records = log.subscribe(SubscriptionTarget::stream("order-1"), None).await?;
//! while let Some(record) = records.next().await {
//!     let record = record?;
//!     println!("{} @ {}", record.event_type(), record.position);
//! }
//! ```

use crate::event::RecordedEvent;
use crate::stream::{DisplayPosition, Position, SubscriptionTarget};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while reading the log.
///
/// Subscriptions drop the stream and re-open it from the last processed
/// position on [transient](LogError::is_transient) errors. Any other error
/// faults the subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The log could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Opening the subscription failed.
    #[error("Subscription to {target} from {from} failed: {reason}")]
    SubscriptionFailed {
        /// What was being subscribed to.
        target: String,
        /// Exclusive start position, rendered.
        from: String,
        /// The reason for failure.
        reason: String,
    },

    /// The subscription was dropped by the server or transport.
    #[error("Subscription dropped: {0}")]
    Dropped(String),

    /// A record could not be read back.
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// The log cannot serve this kind of target.
    #[error("Unsupported target: {0}")]
    UnsupportedTarget(String),
}

impl LogError {
    /// Build a [`LogError::SubscriptionFailed`].
    #[must_use]
    pub fn subscription_failed(
        target: &SubscriptionTarget,
        from: Option<Position>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SubscriptionFailed {
            target: target.to_string(),
            from: DisplayPosition(from).to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if re-opening the subscription may succeed.
    ///
    /// A malformed record is read back the same way every time, and an
    /// unsupported target never becomes supported.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::SubscriptionFailed { .. } | Self::Dropped(_)
        )
    }
}

/// Ordered stream of recorded events, catch-up first then live.
///
/// The stream ending is not a normal condition for a live subscription;
/// consumers treat it like a dropped subscription.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<RecordedEvent, LogError>> + Send>>;

/// Ordered, append-only event log a subscription reads from.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the log can be held as
/// `Arc<dyn EventLog>` by any number of subscriptions.
pub trait EventLog: Send + Sync {
    /// Open a stream over `target` starting strictly after `from`.
    ///
    /// `from = None` starts at the very first event. The returned stream
    /// yields events in log order: all existing events first, then events
    /// appended after the call, without gaps or duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the subscription cannot be opened. Errors
    /// during streaming are yielded as stream items.
    fn subscribe(
        &self,
        target: SubscriptionTarget,
        from: Option<Position>,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, LogError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_failed_renders_target_and_sentinel() {
        let error = LogError::subscription_failed(&SubscriptionTarget::stream("orders"), None, "boom");
        let display = format!("{error}");
        assert!(display.contains("stream:orders"));
        assert!(display.contains("from none"));
        assert!(display.contains("boom"));
    }

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(LogError::ConnectionFailed("down".into()).is_transient());
        assert!(LogError::Dropped("reset".into()).is_transient());
        assert!(LogError::subscription_failed(&SubscriptionTarget::All, None, "busy").is_transient());
        assert!(!LogError::Malformed("bad payload".into()).is_transient());
        assert!(!LogError::UnsupportedTarget("$all".into()).is_transient());
    }
}
