//! Batched checkpoint commits.

use crate::metrics::SubscriptionMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use conveyor_core::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use conveyor_core::environment::Clock;
use conveyor_core::stream::{DisplayPosition, Position};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Decides when the last fully handled position is persisted, and persists it.
///
/// The delivery loop reports every handled position with
/// [`record`](Self::record). A commit is due after `batch_size` recorded
/// positions or once `interval` has elapsed since the last commit, whichever
/// comes first. Only positions reported through `record` are ever written,
/// so the stored checkpoint never runs ahead of a fully handled event.
pub struct CheckpointCommitter {
    subscription_id: String,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    interval: Duration,
    retry: RetryPolicy,
    committed: Option<Position>,
    pending: Option<Position>,
    since_commit: usize,
    last_commit: Instant,
    published: watch::Sender<Option<Position>>,
}

impl CheckpointCommitter {
    /// Create a committer starting from the loaded checkpoint.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        subscription_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
        interval: Duration,
        retry: RetryPolicy,
        loaded: Option<Position>,
        published: watch::Sender<Option<Position>>,
    ) -> Self {
        published.send_replace(loaded);
        Self {
            subscription_id: subscription_id.into(),
            store,
            clock,
            batch_size: batch_size.max(1),
            interval,
            retry,
            committed: loaded,
            pending: loaded,
            since_commit: 0,
            last_commit: Instant::now(),
            published,
        }
    }

    /// Last position known to be stored.
    #[must_use]
    pub const fn committed(&self) -> Option<Position> {
        self.committed
    }

    /// Last fully handled position, committed or not.
    #[must_use]
    pub const fn pending(&self) -> Option<Position> {
        self.pending
    }

    /// Record that every handler finished with `position`.
    pub fn record(&mut self, position: Position) {
        if self.pending.is_none_or(|pending| position > pending) {
            self.pending = Some(position);
        }
        self.since_commit += 1;
    }

    /// Returns true if there is something to commit and the policy says so.
    #[must_use]
    pub fn is_due(&self) -> bool {
        self.has_uncommitted()
            && (self.since_commit >= self.batch_size || self.last_commit.elapsed() >= self.interval)
    }

    fn has_uncommitted(&self) -> bool {
        self.pending > self.committed
    }

    /// Commit if the policy says so.
    ///
    /// # Errors
    ///
    /// Returns the store error once checkpoint retries are exhausted, or
    /// [`RetryError::Cancelled`] if `cancel` fired while backing off.
    pub async fn commit_if_due(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<CheckpointError>> {
        if self.is_due() {
            self.commit(false, cancel).await?;
        }
        Ok(())
    }

    /// Write the pending position now.
    ///
    /// Does nothing when nothing new was handled since the last commit.
    ///
    /// # Errors
    ///
    /// Returns the store error once checkpoint retries are exhausted, or
    /// [`RetryError::Cancelled`] if `cancel` fired while backing off.
    pub async fn commit(
        &mut self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<CheckpointError>> {
        if !self.has_uncommitted() {
            return Ok(());
        }

        let checkpoint = Checkpoint::new(self.subscription_id.clone(), self.pending, self.clock.now());
        let store = Arc::clone(&self.store);
        let stored = retry_with_predicate(
            &self.retry,
            cancel,
            || store.store_checkpoint(checkpoint.clone(), force),
            |error| !matches!(error, CheckpointError::InvalidSubscriptionId(_)),
        )
        .await?;

        if stored.position > self.pending {
            tracing::debug!(
                subscription = %self.subscription_id,
                ours = %DisplayPosition(self.pending),
                stored = %DisplayPosition(stored.position),
                "Checkpoint store holds a later position"
            );
        }

        self.committed = self.pending.max(stored.position);
        self.since_commit = 0;
        self.last_commit = Instant::now();
        self.published.send_replace(self.committed);
        SubscriptionMetrics::record_commit(&self.subscription_id, force);

        tracing::debug!(
            subscription = %self.subscription_id,
            position = %DisplayPosition(self.committed),
            force,
            "Checkpoint committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::environment::SystemClock;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(Option<Position>, bool)>>,
    }

    impl CheckpointStore for RecordingStore {
        fn get_last(
            &self,
            subscription_id: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Checkpoint, CheckpointError>> + Send + '_>> {
            let id = subscription_id.to_string();
            Box::pin(async move { Ok(Checkpoint::start(id, chrono::Utc::now())) })
        }

        fn store_checkpoint(
            &self,
            checkpoint: Checkpoint,
            force: bool,
        ) -> Pin<Box<dyn Future<Output = Result<Checkpoint, CheckpointError>> + Send + '_>> {
            Box::pin(async move {
                if let Ok(mut writes) = self.writes.lock() {
                    writes.push((checkpoint.position, force));
                }
                Ok(checkpoint)
            })
        }

        fn reset(
            &self,
            _subscription_id: &str,
        ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn committer(store: Arc<RecordingStore>, batch_size: usize) -> CheckpointCommitter {
        let (tx, _rx) = watch::channel(None);
        CheckpointCommitter::new(
            "sub",
            store,
            Arc::new(SystemClock),
            batch_size,
            Duration::from_secs(3600),
            RetryPolicy::default(),
            None,
            tx,
        )
    }

    fn writes(store: &RecordingStore) -> Vec<(Option<Position>, bool)> {
        store.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn commits_after_batch_size_events() {
        let store = Arc::new(RecordingStore::default());
        let mut committer = committer(Arc::clone(&store), 2);
        let cancel = CancellationToken::new();

        committer.record(Position::new(0));
        assert!(committer.commit_if_due(&cancel).await.is_ok());
        assert!(writes(&store).is_empty());

        committer.record(Position::new(1));
        assert!(committer.commit_if_due(&cancel).await.is_ok());
        assert_eq!(writes(&store), vec![(Some(Position::new(1)), false)]);
        assert_eq!(committer.committed(), Some(Position::new(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn commits_after_interval_elapsed() {
        let store = Arc::new(RecordingStore::default());
        let (tx, _rx) = watch::channel(None);
        let mut committer = CheckpointCommitter::new(
            "sub",
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Arc::new(SystemClock),
            1000,
            Duration::from_millis(50),
            RetryPolicy::default(),
            None,
            tx,
        );

        committer.record(Position::new(0));
        assert!(!committer.is_due());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(committer.is_due());
    }

    #[tokio::test]
    async fn forced_commit_without_progress_is_a_no_op() {
        let store = Arc::new(RecordingStore::default());
        let mut committer = committer(Arc::clone(&store), 10);

        assert!(committer.commit(true, &CancellationToken::new()).await.is_ok());
        assert!(writes(&store).is_empty());
    }

    #[tokio::test]
    async fn publishes_committed_position() {
        let store = Arc::new(RecordingStore::default());
        let (tx, rx) = watch::channel(None);
        let mut committer = CheckpointCommitter::new(
            "sub",
            store,
            Arc::new(SystemClock),
            1,
            Duration::from_secs(60),
            RetryPolicy::default(),
            None,
            tx,
        );

        committer.record(Position::new(4));
        assert!(committer.commit_if_due(&CancellationToken::new()).await.is_ok());
        assert_eq!(*rx.borrow(), Some(Position::new(4)));
    }
}
