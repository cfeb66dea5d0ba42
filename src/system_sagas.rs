//! The five system saga contracts, registered under the fixed
//! [`SYSTEM_SAGA_GROUP`]. These are the control-plane commands/events that
//! manage saga lifecycle from outside any individual saga's own event
//! handlers: starting, recovering, and compensating an instance, plus the
//! completion events other parts of the system observe.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::envelope::{Envelope, GroupKind, Outbound, Payload, RegisteredPayload};
use crate::handler::{HandlerError, SagaEventsHandler};
use crate::mutex::DistributedMutex;
use crate::registry::TypeRegistry;
use crate::saga::{SagaInstance, SagaRegistry};
use crate::store::SagaStore;
use crate::subscriber::{MessageProcessor, ProcessError};

/// Fixed group every system saga contract is registered under.
pub const SYSTEM_SAGA_GROUP: &str = "systemSaga";

macro_rules! system_payload {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl Payload for $name {
            fn group_kind(&self) -> GroupKind {
                GroupKind::new(SYSTEM_SAGA_GROUP, stringify!($name))
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        impl RegisteredPayload for $name {
            fn type_group_kind() -> GroupKind {
                GroupKind::new(SYSTEM_SAGA_GROUP, stringify!($name))
            }
        }
    };
}

system_payload!(StartSagaCommand {
    saga_uid: String,
    parent_uid: Option<String>,
    saga_name: String,
    saga: serde_json::Value,
});

system_payload!(RecoverSagaCommand { saga_uid: String });

system_payload!(CompensateSagaCommand { saga_uid: String });

system_payload!(SagaCompletedEvent { saga_uid: String });

system_payload!(SagaChildCompletedEvent { saga_uid: String });

/// Registers all five system saga contracts with `registry`. Called by
/// [`crate::bootstrap`] so a freshly built engine always recognizes its
/// own control-plane messages, even before any domain saga is registered.
pub fn register_system_sagas(registry: &TypeRegistry) {
    registry.register::<StartSagaCommand>(SYSTEM_SAGA_GROUP);
    registry.register::<RecoverSagaCommand>(SYSTEM_SAGA_GROUP);
    registry.register::<CompensateSagaCommand>(SYSTEM_SAGA_GROUP);
    registry.register::<SagaCompletedEvent>(SYSTEM_SAGA_GROUP);
    registry.register::<SagaChildCompletedEvent>(SYSTEM_SAGA_GROUP);
}

/// Handles the three control commands directly (they precede or bypass an
/// instance's own turn) and delegates everything else — ordinary domain
/// events, plus `SagaChildCompletedEvent` addressed to a parent instance —
/// to the wrapped [`SagaEventsHandler`].
pub struct SystemSagaProcessor {
    sagas: SagaRegistry,
    store: Arc<dyn SagaStore>,
    mutex: Arc<dyn DistributedMutex>,
    events: Arc<SagaEventsHandler>,
    mutex_ttl: Duration,
}

impl SystemSagaProcessor {
    pub fn new(
        sagas: SagaRegistry,
        store: Arc<dyn SagaStore>,
        mutex: Arc<dyn DistributedMutex>,
        events: Arc<SagaEventsHandler>,
        mutex_ttl: Duration,
    ) -> Self {
        Self {
            sagas,
            store,
            mutex,
            events,
            mutex_ttl,
        }
    }

    async fn handle_start(&self, cmd: StartSagaCommand) -> Result<(), HandlerError> {
        let saga = self.sagas.decode(&cmd.saga_name, &cmd.saga)?;
        let now = Utc::now();
        let mut instance = SagaInstance::new(cmd.saga_uid.clone(), cmd.parent_uid, cmd.saga_name, saga, now);
        instance.start(now)?;
        self.store.create(&instance).await?;
        info!(saga_uid = %cmd.saga_uid, "saga instance started");
        Ok(())
    }

    async fn handle_recover(&self, cmd: RecoverSagaCommand) -> Result<(), HandlerError> {
        self.with_lock(&cmd.saga_uid, |instance, now| instance.recover(now))
            .await
    }

    async fn handle_compensate(&self, cmd: CompensateSagaCommand) -> Result<(), HandlerError> {
        self.with_lock(&cmd.saga_uid, |instance, now| instance.compensate(now))
            .await
    }

    async fn with_lock(
        &self,
        saga_uid: &str,
        transition: impl FnOnce(&mut SagaInstance, chrono::DateTime<Utc>) -> Result<(), crate::saga::SagaError>,
    ) -> Result<(), HandlerError> {
        let token = self
            .mutex
            .lock(saga_uid, self.mutex_ttl, CancellationToken::new())
            .await?;

        let result = async {
            let mut instance = self
                .store
                .get_by_id(saga_uid)
                .await?
                .ok_or_else(|| HandlerError::SagaNotFound(saga_uid.to_string()))?;
            transition(&mut instance, Utc::now())?;
            self.store.update(&instance).await?;
            Ok(())
        }
        .await;

        if let Err(e) = self.mutex.release(&token).await {
            warn!(%saga_uid, error = %e, "failed to release saga mutex after control command");
        }

        result
    }
}

#[async_trait]
impl MessageProcessor for SystemSagaProcessor {
    async fn process(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        if envelope.group_kind().group == SYSTEM_SAGA_GROUP {
            let result: Result<(), HandlerError> = async {
                match envelope.group_kind().kind.as_str() {
                    "StartSagaCommand" => {
                        let cmd: StartSagaCommand = serde_json::from_value(envelope.body().clone())
                            .map_err(|e| crate::registry::RegistryError::MalformedEnvelope(e.to_string()))?;
                        self.handle_start(cmd).await
                    }
                    "RecoverSagaCommand" => {
                        let cmd: RecoverSagaCommand = serde_json::from_value(envelope.body().clone())
                            .map_err(|e| crate::registry::RegistryError::MalformedEnvelope(e.to_string()))?;
                        self.handle_recover(cmd).await
                    }
                    "CompensateSagaCommand" => {
                        let cmd: CompensateSagaCommand = serde_json::from_value(envelope.body().clone())
                            .map_err(|e| crate::registry::RegistryError::MalformedEnvelope(e.to_string()))?;
                        self.handle_compensate(cmd).await
                    }
                    _ => self.events.handle(envelope).await,
                }
            }
            .await;
            return result.map_err(ProcessError::from);
        }

        self.events.handle(envelope).await.map_err(ProcessError::from)
    }
}

/// Builds the outbound delivery for a terminal-completion broadcast.
pub fn outbound_for(event: &SagaCompletedEvent) -> Outbound {
    Outbound::new(
        GroupKind::new(SYSTEM_SAGA_GROUP, "SagaCompletedEvent"),
        serde_json::to_value(event).expect("serde_json::Value serialization is infallible"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_payloads_carry_the_fixed_group() {
        let cmd = StartSagaCommand::default();
        assert_eq!(cmd.group_kind(), GroupKind::new(SYSTEM_SAGA_GROUP, "StartSagaCommand"));

        let event = SagaChildCompletedEvent {
            saga_uid: "child-1".into(),
        };
        assert_eq!(
            event.group_kind(),
            GroupKind::new(SYSTEM_SAGA_GROUP, "SagaChildCompletedEvent")
        );
    }

    #[test]
    fn register_system_sagas_makes_all_five_decodable() {
        let registry = TypeRegistry::new();
        register_system_sagas(&registry);

        for kind in [
            "StartSagaCommand",
            "RecoverSagaCommand",
            "CompensateSagaCommand",
            "SagaCompletedEvent",
            "SagaChildCompletedEvent",
        ] {
            let key = GroupKind::new(SYSTEM_SAGA_GROUP, kind);
            assert!(registry.is_registered(&key), "{kind} should be registered");
        }
    }
}
