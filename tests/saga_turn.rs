//! End-to-end saga turn scenarios, driven straight through
//! `SystemSagaProcessor` the way `Subscriber::run` would dispatch a
//! decoded envelope, but without the transport/worker-pool machinery in
//! the way — so these assert on turn *outcomes*, not on timing.
//!
//! Run with: cargo test --test saga_turn --features test-utils

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use saga_engine::envelope::{Envelope, GroupKind, Headers, Payload, RegisteredPayload};
use saga_engine::handler::{HandlerError, SagaEventsHandler};
use saga_engine::mutex::LocalMutex;
use saga_engine::registry::TypeRegistry;
use saga_engine::router::EndpointRouter;
use saga_engine::saga::{
    Saga, SagaContext, SagaEventHandler, SagaHandlerError, SagaRegistry, SagaStatus, SAGA_GROUP,
};
use saga_engine::store::SagaStore;
use saga_engine::subscriber::{MessageProcessor, ProcessError};
use saga_engine::system_sagas::{self, StartSagaCommand, SYSTEM_SAGA_GROUP};
use saga_engine::test_utils::{
    CompletingSaga, CompletingSagaTrigger, InMemorySagaStore, COMPLETING_SAGA_TRIGGER,
    COMPLETING_SAGA_TRIGGER_GROUP,
};

const DEMO_GROUP: &str = "demo";

/// A saga whose only event handler always fails, to exercise the
/// "handler error aborts the turn" path.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct FailingSaga;

impl Payload for FailingSaga {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(SAGA_GROUP, "FailingSaga")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegisteredPayload for FailingSaga {
    fn type_group_kind() -> GroupKind {
        GroupKind::new(SAGA_GROUP, "FailingSaga")
    }
}

struct AlwaysFails;

#[async_trait]
impl SagaEventHandler for AlwaysFails {
    async fn handle(
        &self,
        _ctx: &mut SagaContext,
        _payload: &dyn Payload,
    ) -> Result<(), SagaHandlerError> {
        Err(SagaHandlerError("business rule violated".to_string()))
    }
}

impl Saga for FailingSaga {
    fn init(&mut self) {}

    fn event_handlers(&self) -> std::collections::HashMap<GroupKind, Arc<dyn SagaEventHandler>> {
        let mut handlers: std::collections::HashMap<GroupKind, Arc<dyn SagaEventHandler>> =
            std::collections::HashMap::new();
        handlers.insert(GroupKind::new(DEMO_GROUP, "Trigger"), Arc::new(AlwaysFails));
        handlers
    }
}

/// The event `FailingSaga` reacts to (by failing).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DemoTrigger;

impl Payload for DemoTrigger {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(DEMO_GROUP, "Trigger")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegisteredPayload for DemoTrigger {
    fn type_group_kind() -> GroupKind {
        GroupKind::new(DEMO_GROUP, "Trigger")
    }
}

/// A payload registered but never wired to any saga's `event_handlers`,
/// used for the "unknown event" scenario.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct UnhandledEvent;

impl Payload for UnhandledEvent {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(DEMO_GROUP, "UnhandledEvent")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegisteredPayload for UnhandledEvent {
    fn type_group_kind() -> GroupKind {
        GroupKind::new(DEMO_GROUP, "UnhandledEvent")
    }
}

struct Harness {
    processor: system_sagas::SystemSagaProcessor,
    store: Arc<InMemorySagaStore>,
}

fn build_harness() -> Harness {
    let sagas = SagaRegistry::new();
    sagas.register::<CompletingSaga>();
    sagas.register::<FailingSaga>();

    let payloads = TypeRegistry::new();
    system_sagas::register_system_sagas(&payloads);
    payloads.register::<CompletingSagaTrigger>(COMPLETING_SAGA_TRIGGER_GROUP);
    payloads.register::<DemoTrigger>(DEMO_GROUP);
    payloads.register::<UnhandledEvent>(DEMO_GROUP);

    let store = Arc::new(InMemorySagaStore::new(sagas.clone()));
    let mutex = Arc::new(LocalMutex::new("saga-turn-tests"));
    let router = EndpointRouter::new();

    let dyn_store: Arc<dyn SagaStore> = store.clone();
    let events = Arc::new(SagaEventsHandler::new(
        payloads,
        dyn_store.clone(),
        mutex.clone(),
        router,
        Duration::from_secs(30),
    ));

    let processor = system_sagas::SystemSagaProcessor::new(
        sagas,
        dyn_store,
        mutex,
        events,
        Duration::from_secs(30),
    );

    Harness { processor, store }
}

fn start_command(uid: &str, parent_uid: Option<&str>, saga_name: &str, saga: serde_json::Value) -> Envelope {
    let cmd = StartSagaCommand {
        saga_uid: uid.to_string(),
        parent_uid: parent_uid.map(str::to_string),
        saga_name: saga_name.to_string(),
        saga,
    };
    Envelope::new(
        uuid::Uuid::new_v4().to_string(),
        SYSTEM_SAGA_GROUP,
        Headers::new(),
        GroupKind::new(SYSTEM_SAGA_GROUP, "StartSagaCommand"),
        serde_json::to_value(&cmd).unwrap(),
    )
}

fn event_for(uid: &str, group_kind: GroupKind, body: serde_json::Value) -> Envelope {
    let mut headers = Headers::new();
    headers.insert("saga_uid", uid);
    Envelope::new(uuid::Uuid::new_v4().to_string(), "test-producer", headers, group_kind, body)
}

#[tokio::test]
async fn start_then_complete_without_a_parent() {
    let harness = build_harness();

    harness
        .processor
        .process(&start_command("saga-1", None, "CompletingSaga", serde_json::to_value(CompletingSaga::default()).unwrap()))
        .await
        .unwrap();

    let trigger = event_for(
        "saga-1",
        GroupKind::new(COMPLETING_SAGA_TRIGGER_GROUP, COMPLETING_SAGA_TRIGGER),
        serde_json::to_value(CompletingSagaTrigger).unwrap(),
    );
    harness.processor.process(&trigger).await.unwrap();

    let instance = harness.store.get_by_id("saga-1").await.unwrap().unwrap();
    assert_eq!(instance.status, SagaStatus::Completed);
    assert!(instance.parent_uid.is_none());
    assert_eq!(
        instance.history.len(),
        2,
        "the trigger itself plus the SagaCompletedEvent notification; CompleteOnTrigger emits no deliveries of its own"
    );
    assert_eq!(instance.history[1].name, "systemSaga/SagaCompletedEvent");
}

#[tokio::test]
async fn start_then_complete_with_a_parent_notifies_it() {
    let harness = build_harness();

    harness
        .processor
        .process(&start_command("parent-1", None, "CompletingSaga", serde_json::to_value(CompletingSaga::default()).unwrap()))
        .await
        .unwrap();
    harness
        .processor
        .process(&start_command(
            "child-1",
            Some("parent-1"),
            "CompletingSaga",
            serde_json::to_value(CompletingSaga::default()).unwrap(),
        ))
        .await
        .unwrap();

    let trigger = event_for(
        "child-1",
        GroupKind::new(COMPLETING_SAGA_TRIGGER_GROUP, COMPLETING_SAGA_TRIGGER),
        serde_json::to_value(CompletingSagaTrigger).unwrap(),
    );
    harness.processor.process(&trigger).await.unwrap();

    let child = harness.store.get_by_id("child-1").await.unwrap().unwrap();
    assert_eq!(child.status, SagaStatus::Completed);
    assert_eq!(child.parent_uid.as_deref(), Some("parent-1"));
    assert_eq!(
        child.history.len(),
        3,
        "the trigger, the SagaCompletedEvent, and the SagaChildCompletedEvent sent to the parent"
    );
    assert_eq!(child.history[1].name, "systemSaga/SagaCompletedEvent");
    assert_eq!(child.history[2].name, "systemSaga/SagaChildCompletedEvent");

    // No endpoint is registered for SagaChildCompletedEvent in this harness,
    // so the notification is dropped with a logged warning rather than
    // failing the turn — the parent's own state is untouched.
    let parent = harness.store.get_by_id("parent-1").await.unwrap().unwrap();
    assert_eq!(parent.status, SagaStatus::InProgress);
}

#[tokio::test]
async fn handler_error_aborts_the_turn_and_nothing_is_persisted() {
    let harness = build_harness();

    harness
        .processor
        .process(&start_command("saga-2", None, "FailingSaga", serde_json::to_value(FailingSaga).unwrap()))
        .await
        .unwrap();

    let before = harness.store.get_by_id("saga-2").await.unwrap().unwrap();
    assert!(before.history.is_empty());

    let trigger = event_for(
        "saga-2",
        GroupKind::new(DEMO_GROUP, "Trigger"),
        serde_json::to_value(DemoTrigger).unwrap(),
    );
    let err = harness.processor.process(&trigger).await.unwrap_err();
    let ProcessError::Retry(err) = err else {
        panic!("expected a retryable error, got {err:?}");
    };
    let err = err.downcast_ref::<HandlerError>().expect("handler error");
    assert!(matches!(err, HandlerError::Handler(_)));

    let after = harness.store.get_by_id("saga-2").await.unwrap().unwrap();
    assert_eq!(after.status, SagaStatus::InProgress);
    assert!(
        after.history.is_empty(),
        "a failed turn must not append history or persist, so the next delivery retries cleanly"
    );
}

#[tokio::test]
async fn unknown_event_is_recorded_and_acked_not_rejected() {
    let harness = build_harness();

    harness
        .processor
        .process(&start_command("saga-3", None, "CompletingSaga", serde_json::to_value(CompletingSaga::default()).unwrap()))
        .await
        .unwrap();

    let unknown = event_for("saga-3", GroupKind::new(DEMO_GROUP, "UnhandledEvent"), serde_json::json!({}));
    harness.processor.process(&unknown).await.unwrap();

    let instance = harness.store.get_by_id("saga-3").await.unwrap().unwrap();
    assert_eq!(instance.status, SagaStatus::InProgress);
    assert_eq!(instance.history.len(), 1);
    assert_eq!(instance.history[0].name, "demo/UnhandledEvent");
}

#[tokio::test]
async fn replaying_the_same_trigger_on_a_completed_saga_errors_without_corrupting_state() {
    let harness = build_harness();

    harness
        .processor
        .process(&start_command("saga-4", None, "CompletingSaga", serde_json::to_value(CompletingSaga::default()).unwrap()))
        .await
        .unwrap();
    let trigger = event_for(
        "saga-4",
        GroupKind::new(COMPLETING_SAGA_TRIGGER_GROUP, COMPLETING_SAGA_TRIGGER),
        serde_json::to_value(CompletingSagaTrigger).unwrap(),
    );
    harness.processor.process(&trigger).await.unwrap();

    let completed_history_len = harness.store.get_by_id("saga-4").await.unwrap().unwrap().history.len();

    let err = harness.processor.process(&trigger).await.unwrap_err();
    let ProcessError::Fatal(err) = err else {
        panic!("expected a fatal, ack-don't-redeliver error, got {err:?}");
    };
    let err = err.downcast_ref::<HandlerError>().expect("handler error");
    assert!(matches!(err, HandlerError::SagaAlreadyCompleted(_)));

    let after = harness.store.get_by_id("saga-4").await.unwrap().unwrap();
    assert_eq!(after.history.len(), completed_history_len);
}
