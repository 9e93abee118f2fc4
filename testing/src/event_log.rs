//! In-memory event log for fast, deterministic subscription tests.
//!
//! [`InMemoryEventLog`] keeps every appended record in a `Vec` and fans new
//! appends out on a broadcast channel. A subscription first replays the
//! stored history after its start position and then follows the live tail.
//! History snapshot and tail registration happen under the same lock as
//! appends, so a subscriber never misses or repeats a record at the seam.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use crate::InjectedFailure;
use chrono::Utc;
use conveyor_core::envelope::checkpoint_position;
use conveyor_core::event::{Event, EventError, RecordedEvent, SerializedEvent};
use conveyor_core::event_log::{EventLog, LogError, RecordStream};
use conveyor_core::stream::{Position, StreamId, SubscriptionTarget};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

const LIVE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct LogState {
    all: Vec<RecordedEvent>,
    revisions: HashMap<StreamId, u64>,
}

#[derive(Debug, Default)]
struct FailurePlan {
    refuse_subscribes: usize,
    refusal: Option<LogError>,
    fail_after: Option<(usize, LogError)>,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<LogState>,
    live: broadcast::Sender<RecordedEvent>,
    failures: Mutex<FailurePlan>,
    subscribes: AtomicUsize,
}

/// In-memory event log.
///
/// Records get a per-stream position (starting at 0) and a global position
/// (starting at 0) on append. Clones share the same log.
///
/// # Example
///
/// ```
/// use conveyor_testing::InMemoryEventLog;
/// use conveyor_core::event::SerializedEvent;
/// use conveyor_core::stream::{Position, StreamId};
///
/// let log = InMemoryEventLog::new();
/// let recorded = log.append(
///     StreamId::new("order-1"),
///     vec![SerializedEvent::new("OrderPlaced.v1".into(), vec![1], Default::default())],
/// );
///
/// assert_eq!(recorded[0].position, Position::new(0));
/// assert_eq!(recorded[0].global_position, Some(Position::new(0)));
/// assert_eq!(log.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryEventLog {
    inner: Arc<Inner>,
}

impl InMemoryEventLog {
    /// Create a new empty log
    #[must_use]
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(LogState::default()),
                live,
                failures: Mutex::new(FailurePlan::default()),
                subscribes: AtomicUsize::new(0),
            }),
        }
    }

    /// Append events to a stream and return them as recorded.
    pub fn append(&self, stream: StreamId, events: Vec<SerializedEvent>) -> Vec<RecordedEvent> {
        let mut guard = self.inner.state.write().unwrap();
        let state = &mut *guard;
        let mut recorded = Vec::with_capacity(events.len());

        for event in events {
            let global = state.all.len() as u64;
            let revision = state.revisions.entry(stream.clone()).or_insert(0);
            let record = RecordedEvent {
                stream_id: stream.clone(),
                position: Position::new(*revision),
                global_position: Some(Position::new(global)),
                created: Utc::now(),
                event,
            };
            *revision += 1;
            state.all.push(record.clone());
            // No receivers is fine: nobody is following the tail yet.
            let _ = self.inner.live.send(record.clone());
            recorded.push(record);
        }
        recorded
    }

    /// Serialize and append one domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the event does not serialize.
    pub fn append_event<E>(
        &self,
        stream: impl Into<StreamId>,
        event: &E,
    ) -> Result<RecordedEvent, EventError>
    where
        E: Event + Serialize,
    {
        let serialized = SerializedEvent::from_event(event)?;
        let mut recorded = self.append(stream.into(), vec![serialized]);
        recorded
            .pop()
            .ok_or_else(|| EventError::SerializationError("nothing appended".to_string()))
    }

    /// All records, in global order.
    #[must_use]
    pub fn records(&self) -> Vec<RecordedEvent> {
        self.inner.state.read().unwrap().all.clone()
    }

    /// Number of records in the log
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.read().unwrap().all.len()
    }

    /// Check if the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `subscribe` was called, failed calls included.
    #[must_use]
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls to `subscribe` fail with
    /// [`LogError::ConnectionFailed`].
    pub fn refuse_next_subscribes(&self, count: usize) {
        let refusal = LogError::ConnectionFailed(InjectedFailure::new("subscribe refused").to_string());
        self.refuse_next_subscribes_with(count, refusal);
    }

    /// Make the next `count` calls to `subscribe` fail with `error`.
    pub fn refuse_next_subscribes_with(&self, count: usize, error: LogError) {
        let mut failures = self.inner.failures.lock().unwrap();
        failures.refuse_subscribes = count;
        failures.refusal = Some(error);
    }

    /// Make the next opened subscription yield `count` records and then
    /// fail with [`LogError::Dropped`].
    pub fn drop_next_subscription_after(&self, count: usize) {
        let dropped = LogError::Dropped(InjectedFailure::new("connection reset").to_string());
        self.fail_next_subscription_after(count, dropped);
    }

    /// Make the next opened subscription yield `count` records and then
    /// `error`, ending the stream.
    pub fn fail_next_subscription_after(&self, count: usize, error: LogError) {
        self.inner.failures.lock().unwrap().fail_after = Some((count, error));
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn is_after(record: &RecordedEvent, target: &SubscriptionTarget, from: Option<Position>) -> bool {
    let in_target = match target {
        SubscriptionTarget::Stream(stream) => &record.stream_id == stream,
        SubscriptionTarget::All => true,
    };
    in_target
        && from.is_none_or(|from| {
            checkpoint_position(record, target).is_ok_and(|position| position > from)
        })
}

impl EventLog for InMemoryEventLog {
    fn subscribe(
        &self,
        target: SubscriptionTarget,
        from: Option<Position>,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, LogError>> + Send + '_>> {
        Box::pin(async move {
            self.inner.subscribes.fetch_add(1, Ordering::SeqCst);

            let fail_after = {
                let mut failures = self.inner.failures.lock().unwrap();
                if failures.refuse_subscribes > 0 {
                    failures.refuse_subscribes -= 1;
                    let refusal = failures.refusal.clone().unwrap_or_else(|| {
                        LogError::ConnectionFailed(InjectedFailure::new("subscribe refused").to_string())
                    });
                    return Err(refusal);
                }
                failures.fail_after.take()
            };

            // Appends hold the write lock, so nothing lands between the
            // snapshot and the tail registration.
            let (history, mut live) = {
                let state = self.inner.state.read().unwrap();
                let history: Vec<RecordedEvent> = state
                    .all
                    .iter()
                    .filter(|record| is_after(record, &target, from))
                    .cloned()
                    .collect();
                (history, self.inner.live.subscribe())
            };

            let records = async_stream::stream! {
                let mut last = from;
                let mut yielded = 0_usize;

                for record in history {
                    if let Some((_, error)) = fail_after.as_ref().filter(|(limit, _)| yielded >= *limit) {
                        yield Err(error.clone());
                        return;
                    }
                    last = checkpoint_position(&record, &target).ok().or(last);
                    yielded += 1;
                    yield Ok(record);
                }

                loop {
                    match live.recv().await {
                        Ok(record) => {
                            if !is_after(&record, &target, last) {
                                continue;
                            }
                            if let Some((_, error)) = fail_after.as_ref().filter(|(limit, _)| yielded >= *limit) {
                                yield Err(error.clone());
                                return;
                            }
                            last = checkpoint_position(&record, &target).ok().or(last);
                            yielded += 1;
                            yield Ok(record);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            yield Err(LogError::Dropped(format!("live tail lagged by {missed} records")));
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            };

            Ok(Box::pin(records) as RecordStream)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use conveyor_core::event::Metadata;
    use futures::StreamExt;
    use std::time::Duration;

    fn event(tag: u8) -> SerializedEvent {
        SerializedEvent::new("Test.v1".to_string(), vec![tag], Metadata::new())
    }

    async fn next_position(records: &mut RecordStream) -> Position {
        tokio::time::timeout(Duration::from_secs(1), records.next())
            .await
            .expect("record within a second")
            .expect("stream open")
            .expect("no error")
            .position
    }

    #[test]
    fn positions_are_per_stream_and_global() {
        let log = InMemoryEventLog::new();
        let first = log.append(StreamId::new("a"), vec![event(1), event(2)]);
        let recorded = log.append(StreamId::new("b"), vec![event(3)]);
        let again = log.append(StreamId::new("a"), vec![event(4)]);

        assert_eq!(first[1].position, Position::new(1));
        assert_eq!(first[1].global_position, Some(Position::new(1)));
        assert_eq!(recorded[0].position, Position::new(0));
        assert_eq!(recorded[0].global_position, Some(Position::new(2)));
        assert_eq!(again[0].position, Position::new(2));
        assert_eq!(again[0].global_position, Some(Position::new(3)));
    }

    #[tokio::test]
    async fn catch_up_then_live_tail_without_gaps() {
        let log = InMemoryEventLog::new();
        log.append(StreamId::new("s"), vec![event(0), event(1)]);

        let mut records = log
            .subscribe(SubscriptionTarget::stream("s"), None)
            .await
            .expect("subscribe");
        assert_eq!(next_position(&mut records).await, Position::new(0));
        assert_eq!(next_position(&mut records).await, Position::new(1));

        log.append(StreamId::new("other"), vec![event(9)]);
        log.append(StreamId::new("s"), vec![event(2)]);
        assert_eq!(next_position(&mut records).await, Position::new(2));
    }

    #[tokio::test]
    async fn subscribe_is_exclusive_of_from() {
        let log = InMemoryEventLog::new();
        log.append(StreamId::new("s"), vec![event(0), event(1), event(2)]);

        let mut records = log
            .subscribe(SubscriptionTarget::stream("s"), Some(Position::new(1)))
            .await
            .expect("subscribe");
        assert_eq!(next_position(&mut records).await, Position::new(2));
    }

    #[tokio::test]
    async fn refused_subscribe_fails_then_recovers() {
        let log = InMemoryEventLog::new();
        log.refuse_next_subscribes(1);

        assert!(matches!(
            log.subscribe(SubscriptionTarget::All, None).await,
            Err(LogError::ConnectionFailed(_))
        ));
        assert!(log.subscribe(SubscriptionTarget::All, None).await.is_ok());
        assert_eq!(log.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn dropped_subscription_yields_error() {
        let log = InMemoryEventLog::new();
        log.append(StreamId::new("s"), vec![event(0), event(1)]);
        log.drop_next_subscription_after(1);

        let mut records = log
            .subscribe(SubscriptionTarget::All, None)
            .await
            .expect("subscribe");
        assert_eq!(next_position(&mut records).await, Position::new(0));
        assert!(matches!(records.next().await, Some(Err(LogError::Dropped(_)))));
    }
}
