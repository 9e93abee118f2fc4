//! End-to-end delivery scenarios over the in-memory collaborators.
//!
//! Each test wires a real subscription (or gateway) to the in-memory log,
//! checkpoint store, document store and producer, and asserts on what the
//! collaborators saw.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use conveyor_core::envelope::EventEnvelope;
use conveyor_core::event::{Event, SerializedEvent};
use conveyor_core::projection::{DocumentFilter, DocumentUpdate, Operation};
use conveyor_core::stream::{Position, SubscriptionTarget};
use conveyor_core::CancellationToken;
use conveyor_gateway::{Gateway, GatewayHandler, GatewayMessage, GatewayProducer, from_fn};
use conveyor_projections::{ProjectionHandler, ProjectionRules};
use conveyor_runtime::{RetryPolicy, Subscription, SubscriptionConfig, SubscriptionError, SubscriptionStatus};
use conveyor_testing::{
    InMemoryCheckpointStore, InMemoryDocumentStore, InMemoryEventLog, InMemoryProducer,
    RecordingHandler, init_tracing, test_clock,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum TestEvent {
    Created { id: String, value: String },
    Noted { id: String },
}

impl Event for TestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "TestEvent.Created.v1",
            Self::Noted { .. } => "TestEvent.Noted.v1",
        }
    }
}

fn created(id: &str, value: &str) -> TestEvent {
    TestEvent::Created {
        id: id.to_string(),
        value: value.to_string(),
    }
}

/// Commits only on stop, retries fast.
fn config() -> SubscriptionConfig {
    SubscriptionConfig::default()
        .with_checkpoint_batch_size(100)
        .with_checkpoint_interval(Duration::from_secs(60))
        .with_handler_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .build(),
        )
}

fn projection(store: &Arc<InMemoryDocumentStore>) -> Arc<ProjectionHandler<TestEvent, InMemoryDocumentStore>> {
    let rules = ProjectionRules::new().on(
        "TestEvent.Created.v1",
        |envelope: &EventEnvelope<TestEvent>| match &envelope.event {
            TestEvent::Created { id, value } => Operation::update(
                DocumentFilter::id(id.as_str()),
                DocumentUpdate::new().set("value", value.as_str()),
            ),
            TestEvent::Noted { .. } => Operation::NoOp,
        },
    );
    Arc::new(ProjectionHandler::from_rules("test-projection", rules, Arc::clone(store)))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_projects_one_document_and_checkpoints_it() {
    init_tracing();
    let log = InMemoryEventLog::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let store = Arc::new(InMemoryDocumentStore::new("test_documents"));
    log.append_event("S", &created("x", "v")).unwrap();

    let handle = Subscription::<TestEvent>::builder("test-projection")
        .target(SubscriptionTarget::stream("S"))
        .event_log(Arc::new(log.clone()))
        .checkpoint_store(Arc::new(checkpoints.clone()))
        .handler(projection(&store))
        .config(config())
        .clock(Arc::new(test_clock()))
        .build()
        .unwrap()
        .start();

    eventually(|| store.len() == 1).await;
    handle.stop().await.unwrap();

    assert_eq!(store.documents(), vec![json!({"id": "x", "value": "v", "position": 0})]);
    assert_eq!(checkpoints.position("test-projection"), Some(Position::new(0)));
}

#[tokio::test]
async fn test_handlers_complete_before_next_event() {
    let log = InMemoryEventLog::new();
    let journal = RecordingHandler::journal();
    let slow = Arc::new(
        RecordingHandler::new("slow")
            .with_journal(Arc::clone(&journal))
            .with_delay(Duration::from_millis(20)),
    );
    let fast = Arc::new(RecordingHandler::new("fast").with_journal(Arc::clone(&journal)));
    for value in ["a", "b", "c"] {
        log.append_event("S", &created("x", value)).unwrap();
    }

    let handle = Subscription::<TestEvent>::builder("ordering")
        .target(SubscriptionTarget::stream("S"))
        .event_log(Arc::new(log.clone()))
        .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
        .handler(slow.clone())
        .handler(fast.clone())
        .config(config())
        .build()
        .unwrap()
        .start();

    assert!(fast.wait_for_calls(3, Duration::from_secs(5)).await);
    handle.stop().await.unwrap();

    let order: Vec<(String, u64)> = journal
        .lock()
        .unwrap()
        .iter()
        .map(|call| (call.handler.clone(), call.position.value()))
        .collect();
    let expected: Vec<(String, u64)> = (0..3)
        .flat_map(|position| [("slow".to_string(), position), ("fast".to_string(), position)])
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_redelivers_after_crash_before_commit() {
    let log = InMemoryEventLog::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let store = Arc::new(InMemoryDocumentStore::new("test_documents"));
    log.append_event("S", &created("x", "v")).unwrap();

    let build = || {
        Subscription::<TestEvent>::builder("crashing")
            .target(SubscriptionTarget::stream("S"))
            .event_log(Arc::new(log.clone()))
            .checkpoint_store(Arc::new(checkpoints.clone()))
            .handler(projection(&store))
            .config(config())
            .build()
            .unwrap()
    };

    // Crash: the task is killed after handling, before any commit.
    let first = tokio::spawn(build().run(CancellationToken::new()));
    eventually(|| store.write_count() == 1).await;
    first.abort();
    assert!(first.await.is_err_and(|error| error.is_cancelled()));
    assert_eq!(checkpoints.position("crashing"), None);
    let once = store.get("x");

    let handle = build().start();
    eventually(|| store.write_count() == 2).await;
    handle.stop().await.unwrap();

    assert_eq!(store.get("x"), once);
    assert_eq!(store.len(), 1);
    assert_eq!(checkpoints.position("crashing"), Some(Position::new(0)));
}

#[tokio::test]
async fn test_noop_events_touch_neither_store_nor_producer() {
    let log = InMemoryEventLog::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let store = Arc::new(InMemoryDocumentStore::new("test_documents"));
    let producer = InMemoryProducer::<()>::new();
    let gateway = GatewayHandler::new(
        "test-gateway",
        Arc::new(GatewayProducer::new(Arc::new(producer.clone()))),
        from_fn(|envelope: &EventEnvelope<TestEvent>| match &envelope.event {
            TestEvent::Created { .. } => vec![GatewayMessage::new(
                "integration",
                SerializedEvent::from_event(&envelope.event).unwrap(),
                (),
            )],
            TestEvent::Noted { .. } => Vec::new(),
        }),
        true,
    );
    log.append_event("S", &TestEvent::Noted { id: "x".to_string() }).unwrap();

    let handle = Subscription::<TestEvent>::builder("noop")
        .target(SubscriptionTarget::stream("S"))
        .event_log(Arc::new(log.clone()))
        .checkpoint_store(Arc::new(checkpoints.clone()))
        .handler(projection(&store))
        .handler(Arc::new(gateway))
        .config(config().with_checkpoint_batch_size(1))
        .build()
        .unwrap()
        .start();

    eventually(|| checkpoints.position("noop") == Some(Position::new(0))).await;
    handle.stop().await.unwrap();

    assert_eq!(store.write_count(), 0);
    assert!(store.is_empty());
    assert_eq!(producer.call_count(), 0);
}

#[tokio::test]
async fn test_faulted_subscription_keeps_checkpoint_empty() {
    let log = InMemoryEventLog::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let handler = Arc::new(RecordingHandler::new("failing").fail_at(Position::new(1)));
    log.append_event("S", &created("x", "first")).unwrap();
    log.append_event("S", &created("x", "second")).unwrap();

    let mut handle = Subscription::<TestEvent>::builder("faulting")
        .target(SubscriptionTarget::stream("S"))
        .event_log(Arc::new(log.clone()))
        .checkpoint_store(Arc::new(checkpoints.clone()))
        .handler(handler.clone())
        .config(config())
        .build()
        .unwrap()
        .start();

    let status = tokio::time::timeout(Duration::from_secs(5), handle.wait_for(SubscriptionStatus::is_faulted))
        .await
        .expect("subscription did not fault");
    assert!(matches!(
        status,
        Some(SubscriptionStatus::Faulted { position: Some(position), .. }) if position == Position::new(1)
    ));

    let result = handle.join().await;
    assert!(matches!(result, Err(SubscriptionError::Faulted { .. })));
    assert_eq!(handler.positions(), vec![Position::new(0)]);
    assert_eq!(handler.attempts(), 4);
    assert_eq!(checkpoints.position("faulting"), None);
    assert!(checkpoints.writes().is_empty());
}

fn forwarding_gateway(
    log: &InMemoryEventLog,
    checkpoints: &InMemoryCheckpointStore,
    producer: &InMemoryProducer<()>,
    await_produce: bool,
) -> Subscription<TestEvent> {
    Gateway::builder::<TestEvent, ()>("forwarding")
        .target(SubscriptionTarget::stream("S"))
        .event_log(Arc::new(log.clone()))
        .checkpoint_store(Arc::new(checkpoints.clone()))
        .producer(Arc::new(producer.clone()))
        .route_and_transform(|envelope: &EventEnvelope<TestEvent>| {
            vec![GatewayMessage::new(
                "integration",
                SerializedEvent::from_event(&envelope.event).unwrap(),
                (),
            )]
        })
        .await_produce(await_produce)
        .config(config().with_checkpoint_batch_size(1))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_awaited_gateway_checkpoints_only_after_acknowledgement() {
    let log = InMemoryEventLog::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let producer = InMemoryProducer::<()>::new().with_latency(Duration::from_secs(5));
    log.append_event("S", &created("x", "v")).unwrap();

    let handle = forwarding_gateway(&log, &checkpoints, &producer, true).start();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(producer.call_count(), 1);
    assert!(producer.produced().is_empty());
    assert_eq!(checkpoints.position("forwarding"), None);

    assert!(producer.wait_for_messages(1, Duration::from_secs(10)).await);
    eventually(|| checkpoints.position("forwarding") == Some(Position::new(0))).await;
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_gateway_checkpoints_before_acknowledgement() {
    let log = InMemoryEventLog::new();
    let checkpoints = InMemoryCheckpointStore::new();
    let producer = InMemoryProducer::<()>::new().with_latency(Duration::from_secs(5));
    log.append_event("S", &created("x", "v")).unwrap();

    let handle = forwarding_gateway(&log, &checkpoints, &producer, false).start();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(checkpoints.position("forwarding"), Some(Position::new(0)));
    assert!(producer.produced().is_empty());

    assert!(producer.wait_for_messages(1, Duration::from_secs(10)).await);
    let produced = producer.produced_to("integration");
    assert_eq!(produced[0].message.event_type, "TestEvent.Created.v1");
    handle.stop().await.unwrap();
}
