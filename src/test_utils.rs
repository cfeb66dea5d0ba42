//! Shared test doubles: an in-memory [`SagaStore`] and a minimal saga
//! whose single event handler just requests completion, used by this
//! crate's own integration tests and available to embedding crates under
//! the `test-utils` feature.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{GroupKind, Payload, RegisteredPayload};
use crate::saga::{
    Saga, SagaContext, SagaEventHandler, SagaHandlerError, SagaInstance, SagaRegistry, SagaStatus,
    SAGA_GROUP,
};
use crate::store::{Result, SagaFilter, SagaStore, StoreError};

/// Row format the in-memory store keeps; mirrors the `sql` backend's
/// split between the saga's persisted JSON body and its history.
struct Row {
    name: String,
    body: serde_json::Value,
    status: SagaStatus,
    parent_uid: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Vec<crate::saga::HistoryEvent>,
}

/// Process-local [`SagaStore`] backed by a `HashMap`. Round-trips every
/// instance through [`SagaRegistry::encode`]/`decode` exactly like the SQL
/// stores do, so a saga's `Default`/business state never survives a
/// `create`/`get_by_id` round trip by reference sharing — catching the
/// same serialization bugs the SQL path would.
pub struct InMemorySagaStore {
    sagas: SagaRegistry,
    rows: Mutex<HashMap<String, Row>>,
}

impl InMemorySagaStore {
    pub fn new(sagas: SagaRegistry) -> Self {
        Self {
            sagas,
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySagaStore {
    fn default() -> Self {
        Self::new(SagaRegistry::new())
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, instance: &SagaInstance) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&instance.uid) {
            return Err(StoreError::Duplicate(instance.uid.clone()));
        }
        let body = self.sagas.encode(&instance.name, instance.saga.as_ref())?;
        rows.insert(
            instance.uid.clone(),
            Row {
                name: instance.name.clone(),
                body,
                status: instance.status,
                parent_uid: instance.parent_uid.clone(),
                started_at: instance.started_at,
                updated_at: instance.updated_at,
                history: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update(&self, instance: &SagaInstance) -> Result<()> {
        let body = self.sagas.encode(&instance.name, instance.saga.as_ref())?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .entry(instance.uid.clone())
            .or_insert_with(|| Row {
                name: instance.name.clone(),
                body: body.clone(),
                status: instance.status,
                parent_uid: instance.parent_uid.clone(),
                started_at: instance.started_at,
                updated_at: instance.updated_at,
                history: Vec::new(),
            });
        row.body = body;
        row.status = instance.status;
        row.updated_at = instance.updated_at;

        let known: std::collections::HashSet<String> =
            row.history.iter().map(|h| h.id.clone()).collect();
        for event in &instance.history {
            if !known.contains(&event.id) {
                row.history.push(event.clone());
            }
        }
        Ok(())
    }

    async fn get_by_id(&self, uid: &str) -> Result<Option<SagaInstance>> {
        let rows = self.rows.lock().unwrap();
        let Some(row) = rows.get(uid) else {
            return Ok(None);
        };
        let saga = self.sagas.decode(&row.name, &row.body)?;
        Ok(Some(SagaInstance {
            uid: uid.to_string(),
            parent_uid: row.parent_uid.clone(),
            name: row.name.clone(),
            saga,
            status: row.status,
            started_at: row.started_at,
            updated_at: row.updated_at,
            history: row.history.clone(),
        }))
    }

    async fn get_by_filter(&self, filters: &[SagaFilter]) -> Result<Vec<SagaInstance>> {
        if filters.is_empty() {
            return Err(StoreError::EmptyFilter);
        }
        let uids: Vec<String> = {
            let rows = self.rows.lock().unwrap();
            rows.iter()
                .filter(|(uid, row)| {
                    filters.iter().all(|f| match f {
                        SagaFilter::SagaUid(want) => uid.as_str() == want.as_str(),
                        SagaFilter::Status(status) => row.status == *status,
                        SagaFilter::SagaType(name) => row.name.as_str() == name.as_str(),
                    })
                })
                .map(|(uid, _)| uid.clone())
                .collect()
        };
        let mut out = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Some(instance) = self.get_by_id(&uid).await? {
                out.push(instance);
            }
        }
        Ok(out)
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        rows.remove(uid)
            .map(|_| ())
            .ok_or_else(|| StoreError::SagaNotFound(uid.to_string()))
    }
}

/// A saga with a single counter and a single event handler that bumps it
/// and requests completion — just enough state machine to drive an
/// end-to-end turn in a test without a real business domain.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CompletingSaga {
    pub counter: u32,
}

impl Payload for CompletingSaga {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(SAGA_GROUP, "CompletingSaga")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegisteredPayload for CompletingSaga {
    fn type_group_kind() -> GroupKind {
        GroupKind::new(SAGA_GROUP, "CompletingSaga")
    }
}

/// Event this saga reacts to by completing.
pub const COMPLETING_SAGA_TRIGGER: &str = "CompletingSagaTrigger";
/// Group the trigger event is registered under.
pub const COMPLETING_SAGA_TRIGGER_GROUP: &str = "test";

struct CompleteOnTrigger;

#[async_trait]
impl SagaEventHandler for CompleteOnTrigger {
    async fn handle(
        &self,
        ctx: &mut SagaContext,
        _payload: &dyn Payload,
    ) -> std::result::Result<(), SagaHandlerError> {
        ctx.request_complete();
        Ok(())
    }
}

impl Saga for CompletingSaga {
    fn init(&mut self) {
        self.counter += 1;
    }

    fn event_handlers(&self) -> HashMap<GroupKind, Arc<dyn SagaEventHandler>> {
        let mut handlers: HashMap<GroupKind, Arc<dyn SagaEventHandler>> = HashMap::new();
        handlers.insert(
            GroupKind::new(COMPLETING_SAGA_TRIGGER_GROUP, COMPLETING_SAGA_TRIGGER),
            Arc::new(CompleteOnTrigger),
        );
        handlers
    }
}

/// The trigger event payload itself.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CompletingSagaTrigger;

impl Payload for CompletingSagaTrigger {
    fn group_kind(&self) -> GroupKind {
        GroupKind::new(COMPLETING_SAGA_TRIGGER_GROUP, COMPLETING_SAGA_TRIGGER)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RegisteredPayload for CompletingSagaTrigger {
    fn type_group_kind() -> GroupKind {
        GroupKind::new(COMPLETING_SAGA_TRIGGER_GROUP, COMPLETING_SAGA_TRIGGER)
    }
}
