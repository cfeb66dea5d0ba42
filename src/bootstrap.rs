//! Composition root.
//!
//! [`EngineBuilder`] wires a [`TypeRegistry`], a [`SagaRegistry`], a
//! [`SagaStore`], a [`DistributedMutex`], an [`EndpointRouter`] and a
//! [`Transport`] into a runnable [`Engine`], the way
//! `standalone::RuntimeBuilder` assembles a runtime in the aggregate/
//! projector/saga sidecars this engine is modeled on.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::EngineConfig;
use crate::envelope::GroupKind;
use crate::handler::SagaEventsHandler;
use crate::mutex::{DistributedMutex, LocalMutex};
use crate::registry::TypeRegistry;
use crate::router::{Endpoint, EndpointRouter, TransportEndpoint};
use crate::saga::{RegisteredSaga, SagaRegistry};
use crate::store::SagaStore;
use crate::subscriber::{Subscriber, SubscriberConfig};
use crate::system_sagas::{self, SystemSagaProcessor};
use crate::transport::{ChannelTransport, Transport};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no store configured; call with_store or a with_* storage helper")]
    MissingStore,

    #[error("no transport configured; call with_transport or a with_* transport helper")]
    MissingTransport,

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(sqlx::Error),

    #[cfg(feature = "redis-mutex")]
    #[error("redis mutex error: {0}")]
    Redis(crate::mutex::MutexError),
}

/// Builds an [`Engine`] from configuration plus whatever sagas the
/// embedding application registers.
pub struct EngineBuilder {
    config: EngineConfig,
    payloads: TypeRegistry,
    sagas: SagaRegistry,
    store: Option<Arc<dyn SagaStore>>,
    mutex: Option<Arc<dyn DistributedMutex>>,
    transport: Option<Arc<dyn Transport>>,
    router: EndpointRouter,
    queues: Vec<String>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        let payloads = TypeRegistry::new();
        system_sagas::register_system_sagas(&payloads);
        Self {
            config,
            payloads,
            sagas: SagaRegistry::new(),
            store: None,
            mutex: None,
            transport: None,
            router: EndpointRouter::new(),
            queues: Vec::new(),
        }
    }

    /// Registers a domain saga type so incoming `StartSagaCommand`s and
    /// stored instances of this kind can be decoded.
    pub fn register_saga<T: RegisteredSaga>(mut self) -> Self {
        self.sagas.register::<T>();
        self
    }

    /// Registers a domain event/command payload so envelopes carrying it
    /// can be decoded by [`crate::handler::SagaEventsHandler`].
    pub fn register_payload<T: crate::envelope::RegisteredPayload>(
        mut self,
        group: impl Into<String>,
    ) -> Self {
        self.payloads.register::<T>(group);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_mutex(mut self, mutex: Arc<dyn DistributedMutex>) -> Self {
        self.mutex = Some(mutex);
        self
    }

    /// Uses the process-local mutex (single-replica deployments and tests).
    pub fn with_local_mutex(mut self, holder: impl Into<String>) -> Self {
        self.mutex = Some(Arc::new(LocalMutex::new(holder)));
        self
    }

    #[cfg(feature = "redis-mutex")]
    pub async fn with_redis_mutex(
        mut self,
        url: &str,
        holder: impl Into<String>,
    ) -> Result<Self, BootstrapError> {
        let mutex = crate::mutex::RedisMutex::new(url, holder)
            .await
            .map_err(BootstrapError::Redis)?;
        self.mutex = Some(Arc::new(mutex));
        Ok(self)
    }

    #[cfg(feature = "sqlite")]
    pub async fn with_sqlite(mut self, url: &str) -> Result<Self, BootstrapError> {
        let pool = sqlx::SqlitePool::connect(url)
            .await
            .map_err(BootstrapError::Sqlite)?;
        crate::store::sql::sqlite::run_migrations(&pool)
            .await
            .map_err(BootstrapError::Sqlite)?;
        let store = crate::store::sql::sqlite::SqliteSagaStore::new(pool, self.sagas.clone());
        self.store = Some(Arc::new(store));
        Ok(self)
    }

    #[cfg(feature = "postgres")]
    pub async fn with_postgres(mut self, url: &str) -> Result<Self, BootstrapError> {
        let pool = sqlx::PgPool::connect(url)
            .await
            .map_err(BootstrapError::Postgres)?;
        crate::store::sql::postgres::run_migrations(&pool)
            .await
            .map_err(BootstrapError::Postgres)?;
        let store = crate::store::sql::postgres::PostgresSagaStore::new(pool, self.sagas.clone());
        self.store = Some(Arc::new(store));
        Ok(self)
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses the in-process channel transport (single-replica deployments
    /// and tests); no broker, no network.
    pub fn with_channel_transport(mut self) -> Self {
        self.transport = Some(Arc::new(ChannelTransport::new()));
        self
    }

    #[cfg(feature = "amqp")]
    pub async fn with_amqp(mut self, url: &str) -> Result<Self, BootstrapError> {
        let config = crate::transport::AmqpConfig::new(url);
        let transport = crate::transport::AmqpTransport::new(config).await?;
        self.transport = Some(Arc::new(transport));
        Ok(self)
    }

    /// Declares `topic` and binds `queue` to it, then adds `queue` to the
    /// set the built [`Engine`] consumes from. Also registers a
    /// [`TransportEndpoint`] so outbound deliveries for `key` are
    /// published back onto the same transport.
    pub async fn with_queue(
        self,
        topic: &str,
        queue: &str,
        key: GroupKind,
    ) -> Result<Self, BootstrapError> {
        let transport = self.transport.clone().ok_or(BootstrapError::MissingTransport)?;
        transport.declare_topic(topic).await?;
        transport
            .declare_queue(queue, &[topic.to_string()])
            .await?;
        self.router
            .register(key, Arc::new(TransportEndpoint::new(topic, transport)))
            .await;

        let mut builder = self;
        builder.queues.push(queue.to_string());
        Ok(builder)
    }

    /// Registers an arbitrary [`Endpoint`] for outbound deliveries of `key`,
    /// bypassing [`with_queue`]'s transport-coupled convenience.
    pub async fn register_endpoint(self, key: GroupKind, endpoint: Arc<dyn Endpoint>) -> Self {
        self.router.register(key, endpoint).await;
        self
    }

    pub async fn build(self) -> Result<Engine, BootstrapError> {
        let store = self.store.ok_or(BootstrapError::MissingStore)?;
        let transport = self.transport.ok_or(BootstrapError::MissingTransport)?;
        let mutex = self.mutex.unwrap_or_else(|| Arc::new(LocalMutex::new("engine")));

        let events = Arc::new(SagaEventsHandler::new(
            self.payloads,
            store.clone(),
            mutex.clone(),
            self.router.clone(),
            self.config.mutex.lock_ttl(),
        ));

        let processor = Arc::new(SystemSagaProcessor::new(
            self.sagas,
            store,
            mutex,
            events,
            self.config.mutex.lock_ttl(),
        ));

        let subscriber_config = SubscriberConfig {
            pool_size: self.config.dispatcher.pool_size,
            schedule_timeout: self.config.dispatcher.schedule_timeout(),
            package_processing_max_time: self.config.dispatcher.package_processing_max_time(),
            graceful_shutdown_timeout: self.config.dispatcher.graceful_shutdown_timeout(),
        };

        let subscriber = Subscriber::new(transport, processor, subscriber_config);
        info!(queues = ?self.queues, "engine built");

        Ok(Engine {
            subscriber: Arc::new(subscriber),
            queues: self.queues,
        })
    }
}

/// A fully wired, runnable saga engine.
pub struct Engine {
    subscriber: Arc<Subscriber>,
    queues: Vec<String>,
}

impl Engine {
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Drives the consume loop until `cancel` fires, then drains and
    /// disconnects.
    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) -> Result<(), crate::subscriber::SubscriberError> {
        self.subscriber.run(&self.queues, cancel).await
    }

    /// Drives the consume loop until SIGINT/SIGTERM, then drains and
    /// disconnects.
    pub async fn run_until_signal(&self) -> Result<(), crate::subscriber::SubscriberError> {
        self.subscriber.run_until_signal(&self.queues).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CompletingSaga, InMemorySagaStore};

    #[tokio::test]
    async fn build_fails_without_a_store() {
        let err = EngineBuilder::new(EngineConfig::default())
            .with_channel_transport()
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::MissingStore));
    }

    #[tokio::test]
    async fn build_fails_without_a_transport() {
        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::default());
        let err = EngineBuilder::new(EngineConfig::default())
            .with_store(store)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::MissingTransport));
    }

    #[tokio::test]
    async fn build_succeeds_with_store_and_transport() {
        let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::default());
        let engine = EngineBuilder::new(EngineConfig::default())
            .register_saga::<CompletingSaga>()
            .with_store(store)
            .with_local_mutex("test")
            .with_channel_transport()
            .build()
            .await
            .unwrap();
        assert_eq!(engine.subscriber().busy_workers(), 0);
    }
}
