//! Saga Events Handler: executes one turn for an incoming envelope.
//!
//! [`SagaEventsHandler::handle`] is the 11-step algorithm — extract the
//! saga UID, lock, load, dispatch to the saga's own event handler, persist,
//! and (on completion) notify a parent saga. It implements
//! [`crate::subscriber::MessageProcessor`] so a [`crate::subscriber::Subscriber`]
//! can drive it directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::envelope::{Envelope, GroupKind, Headers, Outbound, SAGA_UID_HEADER};
use crate::mutex::{DistributedMutex, MutexError};
use crate::registry::{RegistryError, TypeRegistry};
use crate::router::{EndpointRouter, RouterError};
use crate::saga::{HistoryEvent, SagaContext, SagaError, SagaHandlerError, SagaStatus};
use crate::store::{SagaStore, StoreError};
use crate::subscriber::{MessageProcessor, ProcessError};
use crate::system_sagas::{self, SagaChildCompletedEvent, SagaCompletedEvent, SYSTEM_SAGA_GROUP};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("envelope is missing the saga_uid header")]
    MissingSagaUid,

    #[error("saga '{0}' not found")]
    SagaNotFound(String),

    #[error("saga '{0}' has already completed")]
    SagaAlreadyCompleted(String),

    #[error("mutex error: {0}")]
    Mutex(#[from] MutexError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("saga state error: {0}")]
    Saga(#[from] SagaError),

    #[error("payload codec error: {0}")]
    Registry(#[from] RegistryError),

    #[error("saga handler error: {0}")]
    Handler(#[from] SagaHandlerError),

    #[error("router error: {0}")]
    Router(#[from] RouterError),
}

impl From<HandlerError> for ProcessError {
    /// Redelivering a message can only help if the failure was transient
    /// or the saga's own state might change by the next attempt. A saga
    /// that has already completed never will, so that one kind is `Fatal`
    /// (ack, don't redeliver); everything else is `Retry`.
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::SagaAlreadyCompleted(_) => ProcessError::Fatal(Box::new(e)),
            other => ProcessError::Retry(Box::new(other)),
        }
    }
}

/// Executes one turn for every incoming envelope addressed to a saga.
pub struct SagaEventsHandler {
    payloads: TypeRegistry,
    store: Arc<dyn SagaStore>,
    mutex: Arc<dyn DistributedMutex>,
    router: EndpointRouter,
    mutex_ttl: Duration,
    mutex_release_grace: Duration,
}

impl SagaEventsHandler {
    pub fn new(
        payloads: TypeRegistry,
        store: Arc<dyn SagaStore>,
        mutex: Arc<dyn DistributedMutex>,
        router: EndpointRouter,
        mutex_ttl: Duration,
    ) -> Self {
        Self {
            payloads,
            store,
            mutex,
            router,
            mutex_ttl,
            mutex_release_grace: Duration::from_secs(30),
        }
    }

    pub async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let saga_uid = envelope
            .saga_uid()
            .ok_or(HandlerError::MissingSagaUid)?
            .to_string();

        let lock_cancel = CancellationToken::new();
        let token = self
            .mutex
            .lock(&saga_uid, self.mutex_ttl, lock_cancel)
            .await?;

        let result = self.run_turn(envelope, &saga_uid).await;

        match tokio::time::timeout(self.mutex_release_grace, self.mutex.release(&token)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%saga_uid, error = %e, "failed to release saga mutex, relying on TTL expiry");
            }
            Err(_elapsed) => {
                warn!(%saga_uid, "mutex release timed out within its grace period, relying on TTL expiry");
            }
        }

        result
    }

    async fn run_turn(&self, envelope: &Envelope, saga_uid: &str) -> Result<(), HandlerError> {
        let mut instance = self
            .store
            .get_by_id(saga_uid)
            .await?
            .ok_or_else(|| HandlerError::SagaNotFound(saga_uid.to_string()))?;

        if instance.status == SagaStatus::Completed {
            return Err(HandlerError::SagaAlreadyCompleted(saga_uid.to_string()));
        }

        instance.saga.init();
        let now = Utc::now();
        // A compensating instance has no "progress" edge back to itself
        // (only a compensation handler's own request_complete/request_fail
        // can move it on) — applying progress() here would reject every
        // compensation event with InvalidStateTransition before its
        // handler ever runs.
        if instance.status != SagaStatus::Compensating {
            instance.progress(now)?;
        }

        let handlers = instance.saga.event_handlers();
        let handler = handlers.get(envelope.group_kind()).cloned();

        let payload = self.payloads.decode(envelope.group_kind(), envelope.body())?;

        let mut ctx = SagaContext::new(
            instance.uid.clone(),
            instance.parent_uid.clone(),
            instance.status,
            envelope.headers().clone(),
        );

        match handler {
            Some(handler) => {
                handler.handle(&mut ctx, payload.as_ref()).await?;
            }
            None => {
                warn!(
                    saga_uid = %saga_uid,
                    group = %envelope.group_kind().group,
                    kind = %envelope.group_kind().kind,
                    "no event handler registered for this payload, recording history only"
                );
            }
        }

        let requested_status = ctx.requested_status();
        let deliveries = ctx.into_deliveries();

        for delivery in &deliveries {
            let mut headers = envelope.headers().clone();
            for (key, value) in delivery.headers.iter() {
                headers.insert(key, value.to_string());
            }
            headers.insert(SAGA_UID_HEADER, saga_uid.to_string());

            let outbound = Outbound::new(delivery.group_kind.clone(), delivery.body.clone())
                .with_headers(headers)
                .with_options(delivery.options.clone());
            self.router.send(outbound).await?;
        }

        instance.push_history(HistoryEvent::incoming(
            envelope.group_kind(),
            instance.status,
            envelope.body().clone(),
            envelope.origin(),
            envelope.uid(),
            now,
        ));
        for delivery in &deliveries {
            instance.push_history(HistoryEvent::outgoing(
                &delivery.group_kind,
                instance.status,
                delivery.body.clone(),
                envelope.origin(),
                envelope.uid(),
                now,
            ));
        }

        instance.apply_requested(requested_status, now)?;

        // A completion notification (and, for a child, the notification to
        // its parent) is itself a delivery this turn produced — record it
        // in history alongside the handler's own deliveries, before the
        // single persist below, regardless of whether the send that
        // follows actually reaches an endpoint.
        let mut completion_deliveries: Vec<Outbound> = Vec::new();
        if instance.status == SagaStatus::Completed {
            let completed = SagaCompletedEvent {
                saga_uid: instance.uid.clone(),
            };
            completion_deliveries.push(system_sagas::outbound_for(&completed));

            if let Some(parent_uid) = instance.parent_uid.clone() {
                let mut headers = Headers::new();
                headers.insert(SAGA_UID_HEADER, parent_uid);
                let event = SagaChildCompletedEvent {
                    saga_uid: instance.uid.clone(),
                };
                let outbound = Outbound::new(
                    GroupKind::new(SYSTEM_SAGA_GROUP, "SagaChildCompletedEvent"),
                    serde_json::to_value(&event).expect("serde_json::Value serialization is infallible"),
                )
                .with_headers(headers);
                completion_deliveries.push(outbound);
            }
        }
        for delivery in &completion_deliveries {
            instance.push_history(HistoryEvent::outgoing(
                &delivery.group_kind,
                instance.status,
                delivery.body.clone(),
                envelope.origin(),
                envelope.uid(),
                now,
            ));
        }

        self.store.update(&instance).await?;

        for delivery in completion_deliveries {
            let kind = delivery.group_kind.kind.clone();
            if let Err(e) = self.router.send(delivery).await {
                warn!(saga_uid = %instance.uid, kind = %kind, error = %e, "no endpoint reached for completion notification");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageProcessor for SagaEventsHandler {
    async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        self.handle(envelope).await.map_err(ProcessError::from)
    }
}
