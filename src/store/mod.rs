//! Saga instance storage.
//!
//! [`SagaStore`] is the persistence seam: create/update/load/filter/delete
//! on a two-table schema (`saga`, `saga_history`), implemented generically
//! over a SQL backend in [`sql`].

use async_trait::async_trait;
use thiserror::Error;

use crate::saga::{SagaInstance, SagaStatus};

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod sql;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("saga with uid '{0}' already exists")]
    Duplicate(String),

    #[error("saga with uid '{0}' not found")]
    SagaNotFound(String),

    #[error("GetByFilter requires at least one filter")]
    EmptyFilter,

    #[error("transient store error: {0}")]
    Transient(String),

    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload codec error: {0}")]
    Codec(#[from] crate::registry::RegistryError),
}

/// A recognized filter for [`SagaStore::get_by_filter`]. At least one must
/// be supplied; the empty set is rejected with [`StoreError::EmptyFilter`].
#[derive(Debug, Clone)]
pub enum SagaFilter {
    SagaUid(String),
    Status(SagaStatus),
    SagaType(String),
}

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts the saga row only; history is not persisted on creation.
    /// Fails with [`StoreError::Duplicate`] if the UID already exists.
    async fn create(&self, instance: &SagaInstance) -> Result<()>;

    /// Transactionally overwrites the saga row and appends any history
    /// events not already persisted. History is append-only: existing
    /// events are never updated or deleted.
    async fn update(&self, instance: &SagaInstance) -> Result<()>;

    /// Returns the instance with all history events ordered by
    /// `created_at` ascending, or `None` (not an error) if absent.
    async fn get_by_id(&self, uid: &str) -> Result<Option<SagaInstance>>;

    /// Returns instances matching every supplied filter, deduplicated by
    /// UID. Order is unspecified. Rejects an empty filter set.
    async fn get_by_filter(&self, filters: &[SagaFilter]) -> Result<Vec<SagaInstance>>;

    /// Deletes the saga (history cascades). Fails with
    /// [`StoreError::SagaNotFound`] if no row was affected.
    async fn delete(&self, uid: &str) -> Result<()>;
}
