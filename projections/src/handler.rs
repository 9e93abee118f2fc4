//! The projection handler: events in, document operations out.
//!
//! A [`Projector`] decides, for one event, what should happen to the read
//! model and returns it as an [`Operation`]. The [`ProjectionHandler`] runs
//! that operation against its [`DocumentStore`]. The split keeps the decision
//! pure and testable without a store.
//!
//! Most projections are a table from event type to a function, which is what
//! [`ProjectionRules`] is:
//!
//! ```
//! use conveyor_core::projection::{DocumentUpdate, Operation};
//! use conveyor_projections::handler::ProjectionRules;
//! # use conveyor_core::projection::DocumentStore;
//!
//! # fn rules<S: DocumentStore>() -> ProjectionRules<String, S> {
//! ProjectionRules::new()
//!     .on("OrderPlaced.v1", |envelope| {
//!         Operation::update_by_id(
//!             envelope.stream_id.as_str(),
//!             DocumentUpdate::new().set("status", "placed"),
//!         )
//!     })
//!     .on("OrderShipped.v1", |envelope| {
//!         Operation::update_by_id(
//!             envelope.stream_id.as_str(),
//!             DocumentUpdate::new().set("status", "shipped"),
//!         )
//!     })
//! # }
//! ```

use conveyor_core::envelope::EventEnvelope;
use conveyor_core::handler::{EventHandler, HandleFuture, HandlingStatus};
use conveyor_core::projection::{DocumentStore, Operation};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Decides what an event does to the read model.
///
/// `get_update` must not perform I/O itself; anything effectful goes into
/// [`Operation::RawTask`] or [`Operation::Collection`] and runs when the
/// handler executes it. Events the projector does not care about map to
/// [`Operation::NoOp`].
pub trait Projector<E, S: ?Sized>: Send + Sync {
    /// Resolve the operation for one event.
    fn get_update(&self, envelope: &EventEnvelope<E>) -> Operation<S>;
}

type Rule<E, S> = Box<dyn Fn(&EventEnvelope<E>) -> Operation<S> + Send + Sync>;

/// Event-type keyed registration table.
///
/// Keys are the event type discriminators the events were written with.
/// Registering the same type twice replaces the earlier rule.
pub struct ProjectionRules<E, S: ?Sized> {
    rules: HashMap<String, Rule<E, S>>,
}

impl<E, S: ?Sized> ProjectionRules<E, S> {
    /// An empty table; every event resolves to [`Operation::NoOp`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Register the rule for `event_type`.
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&EventEnvelope<E>) -> Operation<S> + Send + Sync + 'static,
    {
        self.rules.insert(event_type.into(), Box::new(rule));
        self
    }

    /// Returns true if a rule exists for `event_type`.
    #[must_use]
    pub fn handles(&self, event_type: &str) -> bool {
        self.rules.contains_key(event_type)
    }
}

impl<E, S: ?Sized> Default for ProjectionRules<E, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, S: ?Sized> fmt::Debug for ProjectionRules<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.rules.keys().collect();
        types.sort();
        f.debug_struct("ProjectionRules").field("types", &types).finish()
    }
}

impl<E, S: ?Sized> Projector<E, S> for ProjectionRules<E, S> {
    fn get_update(&self, envelope: &EventEnvelope<E>) -> Operation<S> {
        self.rules
            .get(&envelope.event_type)
            .map_or(Operation::NoOp, |rule| rule(envelope))
    }
}

/// Event handler that keeps a document collection up to date.
///
/// Per event:
///
/// | Operation | Effect | Status |
/// |---|---|---|
/// | `NoOp` | nothing | `Ignored` |
/// | `Update` | upsert, stamped with the event position | `Handled` |
/// | `RawTask` | the task is awaited | `Handled` |
/// | `Collection` | closure called with the store and the cancellation token | `Handled` |
///
/// Store errors fail the handler so the subscription retries the event.
pub struct ProjectionHandler<E, S: ?Sized> {
    name: String,
    projector: Box<dyn Projector<E, S>>,
    store: Arc<S>,
}

impl<E, S> ProjectionHandler<E, S>
where
    S: DocumentStore + ?Sized,
{
    /// Create a handler from any projector.
    #[must_use]
    pub fn new<P>(name: impl Into<String>, projector: P, store: Arc<S>) -> Self
    where
        P: Projector<E, S> + 'static,
    {
        Self {
            name: name.into(),
            projector: Box::new(projector),
            store,
        }
    }

    /// Create a handler from a registration table.
    #[must_use]
    pub fn from_rules(name: impl Into<String>, rules: ProjectionRules<E, S>, store: Arc<S>) -> Self
    where
        E: 'static,
        S: 'static,
    {
        Self::new(name, rules, store)
    }

    /// The store the handler writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<E, S> EventHandler<E> for ProjectionHandler<E, S>
where
    E: Send + Sync,
    S: DocumentStore + ?Sized,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, envelope: &'a EventEnvelope<E>) -> HandleFuture<'a> {
        Box::pin(async move {
            let operation = self.projector.get_update(envelope);

            match operation {
                Operation::NoOp => {
                    tracing::debug!(
                        handler = %self.name,
                        event_type = %envelope.event_type,
                        position = %envelope.position(),
                        "No handler for event"
                    );
                    Ok(HandlingStatus::Ignored)
                }
                Operation::Update(update) => {
                    tracing::debug!(
                        handler = %self.name,
                        collection = self.store.collection(),
                        event_type = %envelope.event_type,
                        position = %envelope.position(),
                        filter = %update.filter,
                        "Projecting event"
                    );
                    let update = update.stamped(envelope.position());
                    self.store.upsert(update.filter, update.update).await?;
                    Ok(HandlingStatus::Handled)
                }
                Operation::RawTask(task) => {
                    tracing::debug!(
                        handler = %self.name,
                        event_type = %envelope.event_type,
                        position = %envelope.position(),
                        "Projecting event with a raw task"
                    );
                    task.await?;
                    Ok(HandlingStatus::Handled)
                }
                Operation::Collection(operation) => {
                    tracing::debug!(
                        handler = %self.name,
                        collection = self.store.collection(),
                        event_type = %envelope.event_type,
                        position = %envelope.position(),
                        "Projecting event against the collection"
                    );
                    operation(self.store.as_ref(), envelope.cancellation.clone()).await?;
                    Ok(HandlingStatus::Handled)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;
    use chrono::Utc;
    use conveyor_core::CancellationToken;
    use conveyor_core::event::{Metadata, RecordedEvent, SerializedEvent};
    use conveyor_core::handler::HandlerError;
    use conveyor_core::projection::{DocumentFilter, DocumentUpdate, ProjectionError};
    use conveyor_core::stream::{Position, StreamId, SubscriptionTarget};
    use conveyor_testing::InMemoryDocumentStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone)]
    struct Renamed {
        id: String,
        name: String,
    }

    fn envelope(event_type: &str, position: u64, event: Renamed) -> EventEnvelope<Renamed> {
        let record = RecordedEvent {
            stream_id: StreamId::new(format!("item-{}", event.id)),
            position: Position::new(position),
            global_position: None,
            created: Utc::now(),
            event: SerializedEvent::new(event_type.to_string(), Vec::new(), Metadata::new()),
        };
        EventEnvelope::new(
            event,
            &record,
            &SubscriptionTarget::stream(record.stream_id.clone()),
            "sub",
            CancellationToken::new(),
        )
        .expect("valid envelope")
    }

    fn renamed(id: &str, name: &str) -> Renamed {
        Renamed {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn handler(store: &Arc<InMemoryDocumentStore>) -> ProjectionHandler<Renamed, InMemoryDocumentStore> {
        let rules = ProjectionRules::new().on("Renamed.v1", |envelope: &EventEnvelope<Renamed>| {
            Operation::update_by_id(
                envelope.event.id.clone(),
                DocumentUpdate::new().set("name", envelope.event.name.clone()),
            )
        });
        ProjectionHandler::from_rules("items", rules, Arc::clone(store))
    }

    #[tokio::test]
    async fn update_is_stamped_with_position() {
        let store = Arc::new(InMemoryDocumentStore::new("items"));
        let handler = handler(&store);

        let status = handler
            .handle(&envelope("Renamed.v1", 4, renamed("a", "first")))
            .await;

        assert_eq!(status, Ok(HandlingStatus::Handled));
        assert_eq!(
            store.get("a"),
            Some(json!({"id": "a", "name": "first", "position": 4}))
        );
    }

    #[tokio::test]
    async fn unregistered_type_is_ignored_without_store_calls() {
        let store = Arc::new(InMemoryDocumentStore::new("items"));
        let handler = handler(&store);

        let status = handler
            .handle(&envelope("Deleted.v1", 0, renamed("a", "x")))
            .await;

        assert_eq!(status, Ok(HandlingStatus::Ignored));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_fails_the_handler() {
        let store = Arc::new(InMemoryDocumentStore::new("items"));
        store.fail_next_writes(1);
        let handler = handler(&store);

        let status = handler
            .handle(&envelope("Renamed.v1", 0, renamed("a", "x")))
            .await;

        assert!(matches!(
            status,
            Err(HandlerError::Store(ProjectionError::Storage(_)))
        ));
    }

    #[tokio::test]
    async fn redelivery_leaves_the_same_document() {
        let store = Arc::new(InMemoryDocumentStore::new("items"));
        let handler = handler(&store);
        let event = envelope("Renamed.v1", 2, renamed("a", "same"));

        handler.handle(&event).await.expect("first delivery");
        let once = store.get("a");
        handler.handle(&event).await.expect("redelivery");

        assert_eq!(store.get("a"), once);
    }

    #[tokio::test]
    async fn raw_task_is_awaited_and_not_stamped() {
        let store = Arc::new(InMemoryDocumentStore::new("items"));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let rules = ProjectionRules::<Renamed, InMemoryDocumentStore>::new().on("Renamed.v1", move |_| {
            let flag = Arc::clone(&flag);
            Operation::raw(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        let handler = ProjectionHandler::from_rules("items", rules, Arc::clone(&store));

        let status = handler
            .handle(&envelope("Renamed.v1", 0, renamed("a", "x")))
            .await;

        assert_eq!(status, Ok(HandlingStatus::Handled));
        assert!(ran.load(Ordering::SeqCst));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn collection_operation_gets_the_store() {
        let store = Arc::new(InMemoryDocumentStore::new("items"));
        store
            .upsert(DocumentFilter::id("old"), DocumentUpdate::new().set("stale", true))
            .await
            .expect("seed");
        let rules = ProjectionRules::<Renamed, InMemoryDocumentStore>::new().on("Purged.v1", |_| {
            Operation::collection(|store: &InMemoryDocumentStore, _cancel| {
                Box::pin(async move {
                    store.delete_many(DocumentFilter::eq("stale", true)).await?;
                    Ok(())
                })
            })
        });
        let handler = ProjectionHandler::from_rules("items", rules, Arc::clone(&store));

        let status = handler
            .handle(&envelope("Purged.v1", 0, renamed("a", "x")))
            .await;

        assert_eq!(status, Ok(HandlingStatus::Handled));
        assert!(store.is_empty());
    }

    #[test]
    fn rules_debug_lists_types() {
        let rules = ProjectionRules::<Renamed, InMemoryDocumentStore>::new()
            .on("B.v1", |_| Operation::NoOp)
            .on("A.v1", |_| Operation::NoOp);

        assert!(rules.handles("A.v1"));
        assert_eq!(format!("{rules:?}"), r#"ProjectionRules { types: ["A.v1", "B.v1"] }"#);
    }
}
