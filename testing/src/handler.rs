//! Recording handler with failure injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::InjectedFailure;
use conveyor_core::envelope::EventEnvelope;
use conveyor_core::handler::{EventHandler, HandleFuture, HandlerError, HandlingStatus};
use conveyor_core::stream::{Position, StreamId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// One successful call to a [`RecordingHandler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandledCall {
    /// Name of the handler that recorded the call.
    pub handler: String,
    /// Checkpoint position of the event.
    pub position: Position,
    /// Stream the event was appended to.
    pub stream_id: StreamId,
    /// Event type discriminator.
    pub event_type: String,
}

/// Journal shared between handlers to assert on cross-handler ordering.
pub type Journal = Arc<Mutex<Vec<HandledCall>>>;

/// Handler that records every event it handled.
///
/// Failures can be injected per position (the handler fails every time it
/// sees that position) or for the next N calls. Failed calls are not
/// recorded. An optional delay makes each call take time, for ordering and
/// stop-while-busy tests.
///
/// # Example
///
/// ```
/// use conveyor_testing::RecordingHandler;
/// use conveyor_core::stream::Position;
///
/// let handler = RecordingHandler::new("recorder")
///     .fail_at(Position::new(1))
///     .fail_first(2);
/// assert!(handler.positions().is_empty());
/// ```
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    calls: RwLock<Vec<HandledCall>>,
    journal: Option<Journal>,
    poisoned: HashSet<Position>,
    transient_failures: AtomicUsize,
    attempts: AtomicUsize,
    delay: Duration,
    handled: Notify,
}

impl RecordingHandler {
    /// Create a handler that succeeds on every event.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: RwLock::new(Vec::new()),
            journal: None,
            poisoned: HashSet::new(),
            transient_failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            delay: Duration::ZERO,
            handled: Notify::new(),
        }
    }

    /// Also append every call to a shared journal.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Fail every time the event at `position` is handled.
    #[must_use]
    pub fn fail_at(mut self, position: Position) -> Self {
        self.poisoned.insert(position);
        self
    }

    /// Fail the first `count` calls, whatever the event.
    #[must_use]
    pub fn fail_first(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Take `delay` to handle each event.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every successful call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<HandledCall> {
        self.calls.read().unwrap().clone()
    }

    /// Positions of successful calls, in order.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        self.calls
            .read()
            .unwrap()
            .iter()
            .map(|call| call.position)
            .collect()
    }

    /// Calls made so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` calls succeeded.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let handled = self.handled.notified();
                if self.calls.read().unwrap().len() >= count {
                    return;
                }
                handled.await;
            }
        })
        .await
        .is_ok()
    }

    /// Create an empty shared journal.
    #[must_use]
    pub fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }
}

impl<E: Send + Sync> EventHandler<E> for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, envelope: &'a EventEnvelope<E>) -> HandleFuture<'a> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::select! {
                    () = envelope.cancellation.cancelled() => return Err(HandlerError::Cancelled),
                    () = tokio::time::sleep(self.delay) => {}
                }
            }

            let position = envelope.position();
            let transient = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if transient || self.poisoned.contains(&position) {
                return Err(HandlerError::failed(
                    self.name.clone(),
                    InjectedFailure::new(format!("handler failed at {position}")).to_string(),
                ));
            }

            let call = HandledCall {
                handler: self.name.clone(),
                position,
                stream_id: envelope.stream_id.clone(),
                event_type: envelope.event_type.clone(),
            };
            if let Some(journal) = &self.journal {
                journal.lock().unwrap().push(call.clone());
            }
            self.calls.write().unwrap().push(call);
            self.handled.notify_waiters();

            Ok(HandlingStatus::Handled)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use chrono::Utc;
    use conveyor_core::event::{Metadata, RecordedEvent, SerializedEvent};
    use conveyor_core::stream::SubscriptionTarget;
    use conveyor_core::CancellationToken;

    fn envelope(position: u64) -> EventEnvelope<()> {
        let record = RecordedEvent {
            stream_id: StreamId::new("s"),
            position: Position::new(position),
            global_position: None,
            created: Utc::now(),
            event: SerializedEvent::new("Test.v1".to_string(), Vec::new(), Metadata::new()),
        };
        EventEnvelope::new(
            (),
            &record,
            &SubscriptionTarget::stream("s"),
            "sub".to_string(),
            CancellationToken::new(),
        )
        .expect("valid envelope")
    }

    #[tokio::test]
    async fn records_successful_calls() {
        let handler = RecordingHandler::new("h");
        let status = EventHandler::<()>::handle(&handler, &envelope(3)).await;

        assert_eq!(status, Ok(HandlingStatus::Handled));
        assert_eq!(handler.positions(), vec![Position::new(3)]);
    }

    #[tokio::test]
    async fn fails_first_n_calls_then_succeeds() {
        let handler = RecordingHandler::new("h").fail_first(2);
        let env = envelope(0);

        assert!(EventHandler::<()>::handle(&handler, &env).await.is_err());
        assert!(EventHandler::<()>::handle(&handler, &env).await.is_err());
        assert!(EventHandler::<()>::handle(&handler, &env).await.is_ok());
        assert_eq!(handler.attempts(), 3);
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn poisoned_position_always_fails() {
        let handler = RecordingHandler::new("h").fail_at(Position::new(1));

        assert!(EventHandler::<()>::handle(&handler, &envelope(0)).await.is_ok());
        for _ in 0..3 {
            assert!(EventHandler::<()>::handle(&handler, &envelope(1)).await.is_err());
        }
    }

    #[tokio::test]
    async fn shared_journal_sees_both_handlers() {
        let journal = RecordingHandler::journal();
        let first = RecordingHandler::new("first").with_journal(Arc::clone(&journal));
        let second = RecordingHandler::new("second").with_journal(Arc::clone(&journal));
        let env = envelope(0);

        EventHandler::<()>::handle(&first, &env).await.expect("first");
        EventHandler::<()>::handle(&second, &env).await.expect("second");

        let names: Vec<String> = journal
            .lock()
            .expect("journal")
            .iter()
            .map(|call| call.handler.clone())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
