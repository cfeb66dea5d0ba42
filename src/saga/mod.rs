//! The saga state machine, event-sourced history, and the per-turn
//! execution context a saga's handlers run inside.
//!
//! A saga type is just a [`Payload`] that additionally implements [`Saga`]
//! to supply its event handler table. [`SagaRegistry`] mirrors
//! [`crate::registry::TypeRegistry`]'s factory pattern exactly, but
//! produces `Box<dyn Saga>` rather than `Box<dyn Payload>` — the store
//! needs the narrower trait object back to call `init`/`event_handlers`,
//! which a plain `Payload` doesn't expose.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use serde::{Deserialize, Serialize};

use crate::envelope::{GroupKind, Headers, Outbound, Payload, RegisteredPayload};
use crate::registry::RegistryError;

/// Lifecycle status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Created,
    InProgress,
    Compensating,
    Completed,
    Failed,
    Recovering,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn transition(&self, to: Self, allowed_from: &[Self]) -> Result<Self, SagaError> {
        if allowed_from.contains(self) {
            Ok(to)
        } else {
            Err(SagaError::InvalidStateTransition {
                from: *self,
                to,
            })
        }
    }

    pub fn start(&self) -> Result<Self, SagaError> {
        self.transition(Self::InProgress, &[Self::Created])
    }

    pub fn progress(&self) -> Result<Self, SagaError> {
        self.transition(Self::InProgress, &[Self::InProgress, Self::Recovering])
    }

    pub fn complete(&self) -> Result<Self, SagaError> {
        self.transition(
            Self::Completed,
            &[Self::InProgress, Self::Compensating, Self::Recovering],
        )
    }

    pub fn fail(&self) -> Result<Self, SagaError> {
        self.transition(
            Self::Failed,
            &[Self::InProgress, Self::Compensating, Self::Recovering],
        )
    }

    pub fn compensate(&self) -> Result<Self, SagaError> {
        self.transition(Self::Compensating, &[Self::InProgress])
    }

    /// Valid from any non-terminal status.
    pub fn recover(&self) -> Result<Self, SagaError> {
        if self.is_terminal() {
            Err(SagaError::InvalidStateTransition {
                from: *self,
                to: Self::Recovering,
            })
        } else {
            Ok(Self::Recovering)
        }
    }
}

impl SagaStatus {
    /// Stable textual form for the `status` column — independent of the
    /// `serde` representation, which is free to change for the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
        }
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "in_progress" => Ok(Self::InProgress),
            "compensating" => Ok(Self::Compensating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "recovering" => Ok(Self::Recovering),
            other => Err(format!("unrecognized saga status '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: SagaStatus, to: SagaStatus },
}

/// Whether a [`HistoryEvent`] records something the instance received or
/// something it emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryDirection {
    Incoming,
    Outgoing,
}

impl HistoryDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

impl std::str::FromStr for HistoryDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Self::Incoming),
            "outgoing" => Ok(Self::Outgoing),
            other => Err(format!("unrecognized history direction '{other}'")),
        }
    }
}

/// A persisted record of one envelope relevant to a saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: String,
    pub name: String,
    pub direction: HistoryDirection,
    pub status: SagaStatus,
    pub payload: serde_json::Value,
    pub description: String,
    pub origin: String,
    pub trace_uid: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryEvent {
    pub fn incoming(
        group_kind: &GroupKind,
        status: SagaStatus,
        payload: serde_json::Value,
        origin: impl Into<String>,
        trace_uid: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: group_kind.to_string(),
            direction: HistoryDirection::Incoming,
            status,
            payload,
            description: String::new(),
            origin: origin.into(),
            trace_uid: trace_uid.into(),
            created_at,
        }
    }

    pub fn outgoing(
        group_kind: &GroupKind,
        status: SagaStatus,
        payload: serde_json::Value,
        origin: impl Into<String>,
        trace_uid: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: group_kind.to_string(),
            direction: HistoryDirection::Outgoing,
            status,
            payload,
            description: String::new(),
            origin: origin.into(),
            trace_uid: trace_uid.into(),
            created_at,
        }
    }
}

/// Per-turn context handed to a saga's event handler.
///
/// Grants read access to the instance identity and a buffer for outgoing
/// deliveries; the handler never talks to the transport directly.
pub struct SagaContext {
    uid: String,
    parent_uid: Option<String>,
    status: SagaStatus,
    incoming_headers: Headers,
    deliveries: Vec<Outbound>,
    requested_status: Option<SagaStatus>,
}

impl SagaContext {
    pub fn new(uid: impl Into<String>, parent_uid: Option<String>, status: SagaStatus, incoming_headers: Headers) -> Self {
        Self {
            uid: uid.into(),
            parent_uid,
            status,
            incoming_headers,
            deliveries: Vec::new(),
            requested_status: None,
        }
    }

    /// Requests that the instance transition to `Completed` once this
    /// turn's deliveries and history are committed. A handler calls this
    /// when its business logic determines the saga is done; the handler
    /// itself never mutates `SagaInstance::status` directly.
    pub fn request_complete(&mut self) {
        self.requested_status = Some(SagaStatus::Completed);
    }

    pub fn request_fail(&mut self) {
        self.requested_status = Some(SagaStatus::Failed);
    }

    pub fn request_compensate(&mut self) {
        self.requested_status = Some(SagaStatus::Compensating);
    }

    pub fn requested_status(&self) -> Option<SagaStatus> {
        self.requested_status
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn parent_uid(&self) -> Option<&str> {
        self.parent_uid.as_deref()
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn incoming_headers(&self) -> &Headers {
        &self.incoming_headers
    }

    /// Buffers a message for sending once the turn commits successfully.
    pub fn emit(&mut self, outbound: Outbound) {
        self.deliveries.push(outbound);
    }

    pub fn deliveries(&self) -> &[Outbound] {
        &self.deliveries
    }

    pub fn into_deliveries(self) -> Vec<Outbound> {
        self.deliveries
    }
}

/// One saga's reaction to a single event type.
#[async_trait]
pub trait SagaEventHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut SagaContext,
        payload: &dyn Payload,
    ) -> Result<(), SagaHandlerError>;
}

#[derive(Debug, Error)]
#[error("saga handler failed: {0}")]
pub struct SagaHandlerError(pub String);

/// A saga's business state plus its turn logic.
///
/// `init` is called once per load and must be idempotent — it typically
/// just populates `event_handlers`'s backing map from `self`'s fields, no
/// I/O.
pub trait Saga: Payload {
    fn init(&mut self);

    fn event_handlers(&self) -> HashMap<GroupKind, Arc<dyn SagaEventHandler>>;
}

/// A payload type that is also a registrable saga.
pub trait RegisteredSaga: Saga + RegisteredPayload {}
impl<T: Saga + RegisteredPayload> RegisteredSaga for T {}

/// One concrete execution of a saga, identified by `uid`.
pub struct SagaInstance {
    pub uid: String,
    pub parent_uid: Option<String>,
    pub name: String,
    pub saga: Box<dyn Saga>,
    pub status: SagaStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoryEvent>,
}

impl SagaInstance {
    pub fn new(
        uid: impl Into<String>,
        parent_uid: Option<String>,
        name: impl Into<String>,
        saga: Box<dyn Saga>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: uid.into(),
            parent_uid,
            name: name.into(),
            saga,
            status: SagaStatus::Created,
            started_at: created_at,
            updated_at: created_at,
            history: Vec::new(),
        }
    }

    fn apply(&mut self, status: SagaStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        let next = self.status.start()?;
        self.apply(next, now);
        Ok(())
    }

    pub fn progress(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        let next = self.status.progress()?;
        self.apply(next, now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        let next = self.status.complete()?;
        self.apply(next, now);
        Ok(())
    }

    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        let next = self.status.fail()?;
        self.apply(next, now);
        Ok(())
    }

    pub fn compensate(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        let next = self.status.compensate()?;
        self.apply(next, now);
        Ok(())
    }

    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        let next = self.status.recover()?;
        self.apply(next, now);
        Ok(())
    }

    pub fn push_history(&mut self, event: HistoryEvent) {
        self.history.push(event);
    }

    /// Applies a status transition a handler requested via
    /// [`SagaContext::request_complete`] and friends. A no-op request
    /// (`None`) leaves the status untouched.
    pub fn apply_requested(&mut self, requested: Option<SagaStatus>, now: DateTime<Utc>) -> Result<(), SagaError> {
        match requested {
            None => Ok(()),
            Some(SagaStatus::Completed) => self.complete(now),
            Some(SagaStatus::Failed) => self.fail(now),
            Some(SagaStatus::Compensating) => self.compensate(now),
            Some(other) => Err(SagaError::InvalidStateTransition {
                from: self.status,
                to: other,
            }),
        }
    }
}

/// The fixed group saga payload types register under — a saga's `Kind`
/// is its "registered Kind ... used for reflective reconstruction"
/// (the `name` column of the persisted schema).
pub const SAGA_GROUP: &str = "saga";

struct SagaEntry {
    make: Box<dyn Fn() -> Box<dyn Saga> + Send + Sync>,
    decode: Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Saga>, RegistryError> + Send + Sync>,
    encode: Box<dyn Fn(&dyn Saga) -> Result<serde_json::Value, RegistryError> + Send + Sync>,
}

/// Maps a saga's `Kind` to a factory for its concrete, typed value.
///
/// Construction and lookup mirror [`crate::registry::TypeRegistry`]
/// exactly; this type exists only because the store needs `Box<dyn
/// Saga>` back, not `Box<dyn Payload>`.
#[derive(Clone, Default)]
pub struct SagaRegistry {
    entries: Arc<std::sync::RwLock<HashMap<GroupKind, SagaEntry>>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under [`SAGA_GROUP`]; `T`'s `Kind` becomes the
    /// saga's `name`. Re-registering the same kind replaces the earlier
    /// factory.
    pub fn register<T: RegisteredSaga>(&self) {
        let key = GroupKind::new(SAGA_GROUP, T::type_group_kind().kind);

        let make = Box::new(|| Box::new(T::default()) as Box<dyn Saga>);
        let decode = Box::new(|value: &serde_json::Value| {
            serde_json::from_value::<T>(value.clone())
                .map(|v| Box::new(v) as Box<dyn Saga>)
                .map_err(|e| RegistryError::MalformedEnvelope(e.to_string()))
        });
        let encode = Box::new(|saga: &dyn Saga| {
            let concrete = saga
                .as_any()
                .downcast_ref::<T>()
                .expect("encode called with mismatched concrete type for this saga kind");
            serde_json::to_value(concrete)
                .map_err(|e| RegistryError::MalformedEnvelope(e.to_string()))
        });

        self.entries.write().unwrap().insert(
            key,
            SagaEntry {
                make,
                decode,
                encode,
            },
        );
    }

    pub fn load(&self, kind: &str) -> Result<Box<dyn Saga>, RegistryError> {
        let key = GroupKind::new(SAGA_GROUP, kind);
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(&key)
            .ok_or_else(|| RegistryError::UnregisteredKind(key.clone()))?;
        Ok((entry.make)())
    }

    pub fn decode(&self, kind: &str, body: &serde_json::Value) -> Result<Box<dyn Saga>, RegistryError> {
        let key = GroupKind::new(SAGA_GROUP, kind);
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(&key)
            .ok_or_else(|| RegistryError::UnregisteredKind(key.clone()))?;
        (entry.decode)(body)
    }

    pub fn encode(&self, kind: &str, saga: &dyn Saga) -> Result<serde_json::Value, RegistryError> {
        let key = GroupKind::new(SAGA_GROUP, kind);
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(&key)
            .ok_or_else(|| RegistryError::UnregisteredKind(key.clone()))?;
        (entry.encode)(saga)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_can_only_start() {
        assert_eq!(SagaStatus::Created.start().unwrap(), SagaStatus::InProgress);
        assert!(SagaStatus::Created.progress().is_err());
        assert!(SagaStatus::Created.complete().is_err());
    }

    #[test]
    fn terminal_statuses_reject_recover() {
        assert!(SagaStatus::Completed.recover().is_err());
        assert!(SagaStatus::Failed.recover().is_err());
    }

    #[test]
    fn recovering_can_progress_complete_or_fail() {
        assert_eq!(SagaStatus::Recovering.progress().unwrap(), SagaStatus::InProgress);
        assert_eq!(SagaStatus::Recovering.complete().unwrap(), SagaStatus::Completed);
        assert_eq!(SagaStatus::Recovering.fail().unwrap(), SagaStatus::Failed);
    }

    #[test]
    fn compensating_cannot_compensate_again() {
        assert!(SagaStatus::Compensating.compensate().is_err());
    }

    #[test]
    fn any_non_terminal_can_recover() {
        for status in [
            SagaStatus::Created,
            SagaStatus::InProgress,
            SagaStatus::Compensating,
            SagaStatus::Recovering,
        ] {
            assert_eq!(status.recover().unwrap(), SagaStatus::Recovering);
        }
    }

    #[test]
    fn context_collects_deliveries_in_submission_order() {
        let mut ctx = SagaContext::new("uid-1", None, SagaStatus::InProgress, Headers::new());
        ctx.emit(Outbound::new(GroupKind::new("g", "A"), serde_json::json!({})));
        ctx.emit(Outbound::new(GroupKind::new("g", "B"), serde_json::json!({})));
        let deliveries = ctx.into_deliveries();
        assert_eq!(deliveries[0].group_kind.kind, "A");
        assert_eq!(deliveries[1].group_kind.kind, "B");
    }

    #[test]
    fn requested_complete_transitions_the_instance() {
        let saga: Box<dyn Saga> = Box::new(DemoSaga::default());
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut instance = SagaInstance::new("uid-1", None, "DemoSaga", saga, now);
        instance.start(now).unwrap();

        let mut ctx = SagaContext::new("uid-1", None, instance.status, Headers::new());
        ctx.request_complete();
        instance.apply_requested(ctx.requested_status(), now).unwrap();
        assert_eq!(instance.status, SagaStatus::Completed);
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct DemoSaga {
        counter: u32,
    }

    impl Payload for DemoSaga {
        fn group_kind(&self) -> GroupKind {
            GroupKind::new(SAGA_GROUP, "DemoSaga")
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    impl RegisteredPayload for DemoSaga {
        fn type_group_kind() -> GroupKind {
            GroupKind::new(SAGA_GROUP, "DemoSaga")
        }
    }

    impl Saga for DemoSaga {
        fn init(&mut self) {}
        fn event_handlers(&self) -> HashMap<GroupKind, Arc<dyn SagaEventHandler>> {
            HashMap::new()
        }
    }

    #[test]
    fn saga_registry_round_trips_concrete_type() {
        let registry = SagaRegistry::new();
        registry.register::<DemoSaga>();

        let encoded = registry
            .encode("DemoSaga", &DemoSaga { counter: 5 })
            .unwrap();
        let decoded = registry.decode("DemoSaga", &encoded).unwrap();
        assert_eq!(decoded.group_kind().kind, "DemoSaga");
    }

    #[test]
    fn saga_registry_rejects_unregistered_kind() {
        let registry = SagaRegistry::new();
        let err = registry.decode("Missing", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, RegistryError::UnregisteredKind(_)));
    }
}
