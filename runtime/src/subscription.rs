//! The subscription delivery loop.
//!
//! # Overview
//!
//! A [`Subscription`] reads one [`SubscriptionTarget`] from an [`EventLog`],
//! decodes every record through an [`EventTypeMap`] and hands it to its
//! [`EventHandler`]s. Progress is tracked in a [`CheckpointStore`] under the
//! subscription id.
//!
//! ```text
//! ┌──────────┐  records   ┌──────────────┐  envelope  ┌───────────┐
//! │ EventLog │ ─────────▶ │ Subscription │ ─────────▶ │ handler 1 │ ─▶ handler 2 ─▶ ...
//! └──────────┘            └──────┬───────┘            └───────────┘
//!                                │ every N events / T elapsed / on stop
//!                                ▼
//!                        ┌─────────────────┐
//!                        │ CheckpointStore │
//!                        └─────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - One event in flight at a time. Handlers run one after another in
//!   registration order, and the next event is not read before every handler
//!   finished with the current one.
//! - The checkpoint is exclusive: after a restart, delivery resumes strictly
//!   after the stored position. Everything handled since the last commit is
//!   delivered again (at-least-once).
//! - A failing handler is retried with backoff. Once retries are exhausted
//!   the subscription faults: it stops, keeps the checkpoint where it was and
//!   reports the position and error on its status channel. A position is
//!   never skipped.
//! - A dropped log subscription is re-opened from the last handled position,
//!   with backoff, for as long as it takes. Records at or before that
//!   position are discarded. Log errors that re-opening cannot fix (a
//!   malformed record, a target the log does not serve) fault the
//!   subscription instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use conveyor_runtime::subscription::Subscription;
//! use conveyor_core::stream::SubscriptionTarget;
//!
//! let subscription = Subscription::<OrderEvent>::builder("order-summary")
//!     .target(SubscriptionTarget::All)
//!     .event_log(log)
//!     .checkpoint_store(checkpoints)
//!     .handler(projection)
//!     .build()?;
//!
//! let handle = subscription.start();
//! // ...
//! handle.stop().await?;
//! ```

use crate::committer::CheckpointCommitter;
use crate::config::{FaultAction, SubscriptionConfig};
use crate::error::SubscriptionError;
use crate::metrics::SubscriptionMetrics;
use crate::retry::{RetryError, retry_with_predicate, sleep_or_cancel};
use crate::status::SubscriptionStatus;
use crate::HealthCheck;
use conveyor_core::checkpoint::{CheckpointError, CheckpointStore, validate_subscription_id};
use conveyor_core::envelope::{EventEnvelope, checkpoint_position};
use conveyor_core::environment::{Clock, SystemClock};
use conveyor_core::event::{Decoded, Event, EventTypeMap, RecordedEvent};
use conveyor_core::event_log::EventLog;
use conveyor_core::handler::{EventHandler, HandlerError};
use conveyor_core::stream::{DisplayPosition, Position, SubscriptionTarget};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Why the delivery loop gave up.
#[derive(Debug)]
struct Fault {
    position: Option<Position>,
    reason: String,
}

/// What became of one record.
enum Dispatch {
    /// Every handler finished.
    Handled,
    /// No handler cares about the event type.
    Skipped,
    /// Stop was requested while retrying a handler.
    Interrupted,
}

/// A long-running consumer of one event log target.
///
/// Build with [`Subscription::builder`], then either [`start`](Self::start)
/// it on the tokio runtime or drive it inline with [`run`](Self::run).
pub struct Subscription<E> {
    id: String,
    target: SubscriptionTarget,
    log: Arc<dyn EventLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    handlers: Vec<Arc<dyn EventHandler<E>>>,
    types: EventTypeMap<E>,
    config: SubscriptionConfig,
    clock: Arc<dyn Clock>,
    status: watch::Sender<SubscriptionStatus>,
    committed: watch::Sender<Option<Position>>,
}

impl<E> Subscription<E>
where
    E: Event + DeserializeOwned + Send + Sync + 'static,
{
    /// Start building a subscription with the given id.
    #[must_use]
    pub fn builder(subscription_id: impl Into<String>) -> SubscriptionBuilder<E> {
        SubscriptionBuilder::new(subscription_id)
    }

    /// The subscription id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// What the subscription reads.
    #[must_use]
    pub const fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Receiver for status changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.subscribe()
    }

    /// Receiver for committed checkpoint positions.
    #[must_use]
    pub fn committed_receiver(&self) -> watch::Receiver<Option<Position>> {
        self.committed.subscribe()
    }

    /// Spawn the delivery loop on the current tokio runtime.
    #[must_use]
    pub fn start(self) -> SubscriptionHandle {
        let cancel = CancellationToken::new();
        let id = self.id.clone();
        let status = self.status_receiver();
        let committed = self.committed_receiver();
        let task = tokio::spawn(self.run(cancel.clone()));

        SubscriptionHandle {
            id,
            cancel,
            status,
            committed,
            task,
        }
    }

    /// Run the delivery loop until `cancel` fires or the subscription faults.
    ///
    /// On cancellation the in-flight event is finished and the last handled
    /// position is committed with `force = true` before returning.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Faulted`] if the subscription faulted.
    /// With [`FaultAction::TerminateProcess`] a fault exits the process
    /// instead of returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SubscriptionError> {
        tracing::info!(
            subscription = %self.id,
            target = %self.target,
            handlers = self.handlers.len(),
            "Starting subscription"
        );
        self.status.send_replace(SubscriptionStatus::Starting);

        match self.deliver(&cancel).await {
            Ok(()) => {
                self.status.send_replace(SubscriptionStatus::Stopped);
                tracing::info!(subscription = %self.id, "Subscription stopped");
                Ok(())
            }
            Err(fault) => Err(self.fault(fault)),
        }
    }

    fn fault(&self, fault: Fault) -> SubscriptionError {
        tracing::error!(
            subscription = %self.id,
            position = %DisplayPosition(fault.position),
            reason = %fault.reason,
            fault_action = %self.config.fault_action,
            "Subscription faulted"
        );
        self.status.send_replace(SubscriptionStatus::Faulted {
            position: fault.position,
            reason: fault.reason.clone(),
        });

        if self.config.fault_action == FaultAction::TerminateProcess {
            tracing::error!(subscription = %self.id, "Terminating process after subscription fault");
            std::process::exit(1);
        }

        SubscriptionError::Faulted {
            subscription: self.id.clone(),
            position: fault.position,
            reason: fault.reason,
        }
    }

    async fn deliver(&self, cancel: &CancellationToken) -> Result<(), Fault> {
        let Some(loaded) = self.load_checkpoint(cancel).await? else {
            return Ok(());
        };

        let mut committer = CheckpointCommitter::new(
            self.id.clone(),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.clock),
            self.config.checkpoint_batch_size,
            self.config.checkpoint_interval,
            self.config.checkpoint_retry.clone(),
            loaded,
            self.committed.clone(),
        );
        let mut last_handled = loaded;
        let mut resubscribe_attempt = 0_usize;

        tracing::info!(
            subscription = %self.id,
            checkpoint = %DisplayPosition(loaded),
            "Resuming after checkpoint"
        );

        'subscription: loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => break 'subscription,
                opened = self.log.subscribe(self.target.clone(), last_handled) => opened,
            };

            match opened {
                Ok(mut records) => {
                    tracing::debug!(
                        subscription = %self.id,
                        from = %DisplayPosition(last_handled),
                        "Log subscription opened"
                    );
                    self.status.send_replace(SubscriptionStatus::Running);

                    let mut tick = tokio::time::interval(self.config.checkpoint_interval);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        let next = tokio::select! {
                            biased;
                            () = cancel.cancelled() => break 'subscription,
                            _ = tick.tick() => {
                                self.commit_if_due(&mut committer, cancel).await?;
                                continue;
                            }
                            next = records.next() => next,
                        };

                        let record = match next {
                            Some(Ok(record)) => record,
                            Some(Err(error)) if error.is_transient() => {
                                tracing::warn!(subscription = %self.id, error = %error, "Log subscription dropped");
                                break;
                            }
                            Some(Err(error)) => {
                                return Err(Fault {
                                    position: Some(Position::resume_after(last_handled)),
                                    reason: format!("log read failed: {error}"),
                                });
                            }
                            None => {
                                tracing::warn!(subscription = %self.id, "Log subscription ended");
                                break;
                            }
                        };
                        resubscribe_attempt = 0;

                        let position = checkpoint_position(&record, &self.target).map_err(|error| Fault {
                            position: Some(Position::resume_after(last_handled)),
                            reason: format!("log read failed: {error}"),
                        })?;
                        if last_handled.is_some_and(|last| position <= last) {
                            tracing::debug!(
                                subscription = %self.id,
                                position = %position,
                                "Skipping already handled event"
                            );
                            continue;
                        }

                        match self.dispatch(&record, position, cancel).await? {
                            Dispatch::Handled | Dispatch::Skipped => {
                                last_handled = Some(position);
                                committer.record(position);
                                self.commit_if_due(&mut committer, cancel).await?;
                            }
                            Dispatch::Interrupted => break 'subscription,
                        }
                    }
                }
                Err(error) if !error.is_transient() => {
                    return Err(Fault {
                        position: None,
                        reason: format!("failed to open log subscription: {error}"),
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        subscription = %self.id,
                        attempt = resubscribe_attempt,
                        error = %error,
                        "Failed to open log subscription"
                    );
                }
            }

            let delay = self.config.resubscribe_retry.delay_for_attempt(resubscribe_attempt);
            resubscribe_attempt = resubscribe_attempt.saturating_add(1);
            tracing::info!(
                subscription = %self.id,
                from = %DisplayPosition(last_handled),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Resubscribing"
            );
            if !sleep_or_cancel(delay, cancel).await {
                break;
            }
        }

        self.status.send_replace(SubscriptionStatus::Stopping);
        tracing::info!(
            subscription = %self.id,
            position = %DisplayPosition(committer.pending()),
            "Stopping subscription, committing final checkpoint"
        );

        // The stop signal already fired; the final commit gets its own token
        // so its retries are not cut short.
        committer
            .commit(true, &CancellationToken::new())
            .await
            .map_err(|error| Fault {
                position: committer.pending(),
                reason: format!("final checkpoint commit failed: {}", error.into_inner()),
            })
    }

    /// Load the stored checkpoint. `Ok(None)` means stop was requested.
    async fn load_checkpoint(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Option<Position>>, Fault> {
        let loaded = retry_with_predicate(
            &self.config.checkpoint_retry,
            cancel,
            || self.checkpoints.get_last(&self.id),
            |error| !matches!(error, CheckpointError::InvalidSubscriptionId(_)),
        )
        .await;

        match loaded {
            Ok(checkpoint) => Ok(Some(checkpoint.position)),
            Err(RetryError::Cancelled(_)) => Ok(None),
            Err(error) => Err(Fault {
                position: None,
                reason: format!("failed to load checkpoint: {}", error.into_inner()),
            }),
        }
    }

    async fn commit_if_due(
        &self,
        committer: &mut CheckpointCommitter,
        cancel: &CancellationToken,
    ) -> Result<(), Fault> {
        match committer.commit_if_due(cancel).await {
            // Cancelled mid-backoff: the final forced commit retries it.
            Ok(()) | Err(RetryError::Cancelled(_)) => Ok(()),
            Err(error) => Err(Fault {
                position: committer.pending(),
                reason: format!("checkpoint commit failed: {}", error.into_inner()),
            }),
        }
    }

    async fn dispatch(
        &self,
        record: &RecordedEvent,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<Dispatch, Fault> {
        let event = match self.types.decode(&record.event) {
            Ok(Decoded::Event(event)) => event,
            Ok(Decoded::Unknown) => {
                tracing::debug!(
                    subscription = %self.id,
                    position = %position,
                    event_type = %record.event_type(),
                    "No handler for event type"
                );
                return Ok(Dispatch::Skipped);
            }
            // Decoding is deterministic, retrying cannot help.
            Err(error) => {
                for handler in &self.handlers {
                    SubscriptionMetrics::record_failure(&self.id, handler.name());
                }
                return Err(Fault {
                    position: Some(position),
                    reason: HandlerError::from(error).to_string(),
                });
            }
        };

        let envelope = EventEnvelope::new(event, record, &self.target, self.id.clone(), cancel.clone())
            .map_err(|error| Fault {
                position: Some(position),
                reason: format!("log read failed: {error}"),
            })?;
        if let Ok(lag) = (self.clock.now() - record.created).to_std() {
            SubscriptionMetrics::record_lag(&self.id, lag);
        }

        for handler in &self.handlers {
            if !self.handle_with_retry(handler.as_ref(), &envelope, cancel).await? {
                return Ok(Dispatch::Interrupted);
            }
        }
        Ok(Dispatch::Handled)
    }

    /// Returns `Ok(false)` if stop was requested before the handler succeeded.
    async fn handle_with_retry(
        &self,
        handler: &dyn EventHandler<E>,
        envelope: &EventEnvelope<E>,
        cancel: &CancellationToken,
    ) -> Result<bool, Fault> {
        let policy = &self.config.handler_retry;
        let mut attempt = 0_usize;

        loop {
            let started = Instant::now();
            match handler.handle(envelope).await {
                Ok(status) => {
                    SubscriptionMetrics::record_handled(
                        &self.id,
                        handler.name(),
                        status.as_str(),
                        started.elapsed(),
                    );
                    tracing::debug!(
                        subscription = %self.id,
                        handler = handler.name(),
                        position = %envelope.position(),
                        event_type = %envelope.event_type,
                        status = status.as_str(),
                        "Event handled"
                    );
                    return Ok(true);
                }
                Err(HandlerError::Cancelled) if cancel.is_cancelled() => return Ok(false),
                Err(error) => {
                    SubscriptionMetrics::record_failure(&self.id, handler.name());

                    if !policy.should_retry(attempt) {
                        return Err(Fault {
                            position: Some(envelope.position()),
                            reason: format!(
                                "handler '{}' failed after {} attempts: {error}",
                                handler.name(),
                                attempt + 1
                            ),
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        subscription = %self.id,
                        handler = handler.name(),
                        position = %envelope.position(),
                        event_type = %envelope.event_type,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Handler failed, retrying"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(false);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Builder for [`Subscription`].
///
/// Every collaborator is checked in [`build`](Self::build); nothing fails
/// later for lack of configuration.
pub struct SubscriptionBuilder<E> {
    id: String,
    target: SubscriptionTarget,
    log: Option<Arc<dyn EventLog>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    handlers: Vec<Arc<dyn EventHandler<E>>>,
    types: Option<EventTypeMap<E>>,
    config: SubscriptionConfig,
    clock: Arc<dyn Clock>,
}

impl<E> SubscriptionBuilder<E>
where
    E: Event + DeserializeOwned + Send + Sync + 'static,
{
    fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            id: subscription_id.into(),
            target: SubscriptionTarget::All,
            log: None,
            checkpoints: None,
            handlers: Vec::new(),
            types: None,
            config: SubscriptionConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// What to read. Defaults to the whole log.
    #[must_use]
    pub fn target(mut self, target: SubscriptionTarget) -> Self {
        self.target = target;
        self
    }

    /// The log to read from.
    #[must_use]
    pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Where progress is stored.
    #[must_use]
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Add a handler. Handlers run in the order they are added.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler<E>>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Event types this subscription decodes. Defaults to every type.
    #[must_use]
    pub fn type_map(mut self, types: EventTypeMap<E>) -> Self {
        self.types = Some(types);
        self
    }

    /// Tuning configuration.
    #[must_use]
    pub fn config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for checkpoint timestamps and lag.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Configuration`] for an empty id, a
    /// missing log or checkpoint store, or no handlers, and
    /// [`SubscriptionError::Config`] for an invalid configuration.
    pub fn build(self) -> Result<Subscription<E>, SubscriptionError> {
        validate_subscription_id(&self.id)
            .map_err(|_| SubscriptionError::Configuration("subscription id cannot be empty".into()))?;
        let log = self
            .log
            .ok_or_else(|| SubscriptionError::Configuration("an event log is required".into()))?;
        let checkpoints = self.checkpoints.ok_or_else(|| {
            SubscriptionError::Configuration("a checkpoint store is required".into())
        })?;
        if self.handlers.is_empty() {
            return Err(SubscriptionError::Configuration(
                "at least one handler is required".into(),
            ));
        }
        self.config.validate()?;

        let (status, _) = watch::channel(SubscriptionStatus::Starting);
        let (committed, _) = watch::channel(None);

        Ok(Subscription {
            id: self.id,
            target: self.target,
            log,
            checkpoints,
            handlers: self.handlers,
            types: self.types.unwrap_or_default(),
            config: self.config,
            clock: self.clock,
            status,
            committed,
        })
    }
}

/// Control handle of a started subscription.
pub struct SubscriptionHandle {
    id: String,
    cancel: CancellationToken,
    status: watch::Receiver<SubscriptionStatus>,
    committed: watch::Receiver<Option<Position>>,
    task: JoinHandle<Result<(), SubscriptionError>>,
}

impl SubscriptionHandle {
    /// The subscription id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Last committed checkpoint position.
    #[must_use]
    pub fn last_committed(&self) -> Option<Position> {
        *self.committed.borrow()
    }

    /// Health check for the subscription.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        self.status.borrow().health(&self.id)
    }

    /// The subscription's stop signal.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the status satisfies `predicate`, returning it.
    ///
    /// Returns `None` if the subscription task is gone first.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Option<SubscriptionStatus>
    where
        F: FnMut(&SubscriptionStatus) -> bool,
    {
        self.status.wait_for(predicate).await.ok().map(|status| status.clone())
    }

    /// Request a stop and wait for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns the fault if the subscription faulted before stopping.
    pub async fn stop(self) -> Result<(), SubscriptionError> {
        tracing::info!(subscription = %self.id, "Stop requested");
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the loop to exit without requesting a stop.
    ///
    /// # Errors
    ///
    /// Returns the fault if the subscription faulted, or
    /// [`SubscriptionError::Join`] if the task panicked.
    pub async fn join(self) -> Result<(), SubscriptionError> {
        self.task
            .await
            .map_err(|e| SubscriptionError::Join(e.to_string()))?
    }
}
