//! Unified SQL `SagaStore` implementation.
//!
//! Generic over [`SqlDatabase`]; concrete trait impls are generated by
//! [`impl_sql_saga_store`] once per backend so each expansion works
//! against a concrete `sqlx` pool/row type, mirroring the storage layer's
//! `SqlSnapshotStore` macro.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query};
use sqlx::Row;

use crate::saga::{HistoryDirection, HistoryEvent, SagaInstance, SagaRegistry, SagaStatus};
use crate::store::{Result, SagaFilter, SagaStore, StoreError};

use super::schema::{SagaHistory, Sagas};
use super::SqlDatabase;

/// SQL-backed [`SagaStore`], generic over the database backend.
pub struct SqlSagaStore<DB: SqlDatabase> {
    pool: DB::Pool,
    sagas: SagaRegistry,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlSagaStore<DB> {
    pub fn new(pool: DB::Pool, sagas: SagaRegistry) -> Self {
        Self {
            pool,
            sagas,
            _marker: PhantomData,
        }
    }

    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

fn saga_payload_bytes(sagas: &SagaRegistry, instance: &SagaInstance) -> Result<Vec<u8>> {
    let value = sagas.encode(&instance.name, instance.saga.as_ref())?;
    Ok(serde_json::to_vec(&value).expect("serde_json::Value serialization is infallible"))
}

fn history_payload_bytes(event: &HistoryEvent) -> Vec<u8> {
    serde_json::to_vec(&event.payload).expect("serde_json::Value serialization is infallible")
}

macro_rules! impl_sql_saga_store {
    ($db_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        #[async_trait]
        impl SagaStore for SqlSagaStore<$db_type> {
            async fn create(&self, instance: &SagaInstance) -> Result<()> {
                let payload = saga_payload_bytes(&self.sagas, instance)?;

                let stmt = Query::insert()
                    .into_table(Sagas::Table)
                    .columns([
                        Sagas::Id,
                        Sagas::ParentId,
                        Sagas::Name,
                        Sagas::Payload,
                        Sagas::Status,
                        Sagas::StartedAt,
                        Sagas::UpdatedAt,
                    ])
                    .values_panic([
                        instance.uid.clone().into(),
                        instance.parent_uid.clone().into(),
                        instance.name.clone().into(),
                        payload.into(),
                        instance.status.as_str().into(),
                        instance.started_at.to_rfc3339().into(),
                        instance.updated_at.to_rfc3339().into(),
                    ])
                    .to_owned();

                let sql = <$db_type>::build_insert(stmt);
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| match &e {
                        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                            StoreError::Duplicate(instance.uid.clone())
                        }
                        _ => StoreError::Database(e),
                    })?;
                Ok(())
            }

            async fn update(&self, instance: &SagaInstance) -> Result<()> {
                let payload = saga_payload_bytes(&self.sagas, instance)?;
                let mut tx = self.pool.begin().await?;

                let upsert_stmt = Query::insert()
                    .into_table(Sagas::Table)
                    .columns([
                        Sagas::Id,
                        Sagas::ParentId,
                        Sagas::Name,
                        Sagas::Payload,
                        Sagas::Status,
                        Sagas::StartedAt,
                        Sagas::UpdatedAt,
                    ])
                    .values_panic([
                        instance.uid.clone().into(),
                        instance.parent_uid.clone().into(),
                        instance.name.clone().into(),
                        payload.into(),
                        instance.status.as_str().into(),
                        instance.started_at.to_rfc3339().into(),
                        instance.updated_at.to_rfc3339().into(),
                    ])
                    .on_conflict(
                        OnConflict::column(Sagas::Id)
                            .update_columns([
                                Sagas::ParentId,
                                Sagas::Name,
                                Sagas::Payload,
                                Sagas::Status,
                                Sagas::UpdatedAt,
                            ])
                            .to_owned(),
                    )
                    .to_owned();
                let upsert_sql = <$db_type>::build_insert(upsert_stmt);
                sqlx::query(&upsert_sql).execute(&mut *tx).await?;

                let existing_stmt = Query::select()
                    .column(SagaHistory::Id)
                    .from(SagaHistory::Table)
                    .and_where(Expr::col(SagaHistory::SagaId).eq(instance.uid.clone()))
                    .to_owned();
                let existing_sql = <$db_type>::build_select(existing_stmt);
                let existing_rows = sqlx::query(&existing_sql).fetch_all(&mut *tx).await?;
                let existing_ids: HashSet<String> = existing_rows
                    .iter()
                    .map(|row| row.get::<String, _>("id"))
                    .collect();

                for event in &instance.history {
                    if existing_ids.contains(&event.id) {
                        continue;
                    }
                    let insert_stmt = Query::insert()
                        .into_table(SagaHistory::Table)
                        .columns([
                            SagaHistory::Id,
                            SagaHistory::SagaId,
                            SagaHistory::Name,
                            SagaHistory::Type,
                            SagaHistory::Status,
                            SagaHistory::Payload,
                            SagaHistory::Description,
                            SagaHistory::OriginSource,
                            SagaHistory::CreatedAt,
                        ])
                        .values_panic([
                            event.id.clone().into(),
                            instance.uid.clone().into(),
                            event.name.clone().into(),
                            event.direction.as_str().into(),
                            event.status.as_str().into(),
                            history_payload_bytes(event).into(),
                            event.description.clone().into(),
                            event.origin.clone().into(),
                            event.created_at.to_rfc3339().into(),
                        ])
                        .to_owned();
                    let insert_sql = <$db_type>::build_insert(insert_stmt);
                    sqlx::query(&insert_sql).execute(&mut *tx).await?;
                }

                tx.commit().await?;
                Ok(())
            }

            async fn get_by_id(&self, uid: &str) -> Result<Option<SagaInstance>> {
                let stmt = Query::select()
                    .columns([
                        Sagas::Id,
                        Sagas::ParentId,
                        Sagas::Name,
                        Sagas::Payload,
                        Sagas::Status,
                        Sagas::StartedAt,
                        Sagas::UpdatedAt,
                    ])
                    .from(Sagas::Table)
                    .and_where(Expr::col(Sagas::Id).eq(uid))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                let Some(row) = row else {
                    return Ok(None);
                };

                let name: String = row.get("name");
                let payload_bytes: Vec<u8> = row.get("payload");
                let payload_value: serde_json::Value = serde_json::from_slice(&payload_bytes)
                    .map_err(|e| StoreError::Codec(crate::registry::RegistryError::MalformedEnvelope(e.to_string())))?;
                let saga = self.sagas.decode(&name, &payload_value)?;

                let status_str: String = row.get("status");
                let status = SagaStatus::from_str(&status_str)
                    .map_err(|e| StoreError::Codec(crate::registry::RegistryError::MalformedEnvelope(e)))?;

                let started_at = parse_rfc3339(row.get::<String, _>("started_at"))?;
                let updated_at = parse_rfc3339(row.get::<String, _>("updated_at"))?;
                let parent_id: Option<String> = row.get("parent_id");

                let history_stmt = Query::select()
                    .columns([
                        SagaHistory::Id,
                        SagaHistory::Name,
                        SagaHistory::Type,
                        SagaHistory::Status,
                        SagaHistory::Payload,
                        SagaHistory::Description,
                        SagaHistory::OriginSource,
                        SagaHistory::CreatedAt,
                    ])
                    .from(SagaHistory::Table)
                    .and_where(Expr::col(SagaHistory::SagaId).eq(uid))
                    .order_by(SagaHistory::CreatedAt, sea_query::Order::Asc)
                    .to_owned();
                let history_sql = <$db_type>::build_select(history_stmt);
                let history_rows = sqlx::query(&history_sql).fetch_all(&self.pool).await?;

                let mut history = Vec::with_capacity(history_rows.len());
                for row in history_rows {
                    let payload_bytes: Vec<u8> = row.get("payload");
                    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes).map_err(|e| {
                        StoreError::Codec(crate::registry::RegistryError::MalformedEnvelope(e.to_string()))
                    })?;
                    let direction_str: String = row.get("type");
                    let direction = HistoryDirection::from_str(&direction_str)
                        .map_err(|e| StoreError::Codec(crate::registry::RegistryError::MalformedEnvelope(e)))?;
                    let status_str: String = row.get("status");
                    let status = SagaStatus::from_str(&status_str)
                        .map_err(|e| StoreError::Codec(crate::registry::RegistryError::MalformedEnvelope(e)))?;

                    history.push(HistoryEvent {
                        id: row.get("id"),
                        name: row.get("name"),
                        direction,
                        status,
                        payload,
                        description: row.get("description"),
                        origin: row.get("origin_source"),
                        trace_uid: String::new(),
                        created_at: parse_rfc3339(row.get::<String, _>("created_at"))?,
                    });
                }

                Ok(Some(SagaInstance {
                    uid: uid.to_string(),
                    parent_uid: parent_id,
                    name,
                    saga,
                    status,
                    started_at,
                    updated_at,
                    history,
                }))
            }

            async fn get_by_filter(&self, filters: &[SagaFilter]) -> Result<Vec<SagaInstance>> {
                if filters.is_empty() {
                    return Err(StoreError::EmptyFilter);
                }

                let mut stmt = Query::select();
                stmt.column((Sagas::Table, Sagas::Id))
                    .from(Sagas::Table)
                    .left_join(
                        SagaHistory::Table,
                        Expr::col((Sagas::Table, Sagas::Id))
                            .equals((SagaHistory::Table, SagaHistory::SagaId)),
                    );

                for filter in filters {
                    match filter {
                        SagaFilter::SagaUid(uid) => {
                            stmt.and_where(Expr::col((Sagas::Table, Sagas::Id)).eq(uid.clone()));
                        }
                        SagaFilter::Status(status) => {
                            stmt.and_where(
                                Expr::col((Sagas::Table, Sagas::Status)).eq(status.as_str()),
                            );
                        }
                        SagaFilter::SagaType(name) => {
                            stmt.and_where(Expr::col((Sagas::Table, Sagas::Name)).eq(name.clone()));
                        }
                    }
                }

                let sql = <$db_type>::build_select(stmt.to_owned());
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

                let mut seen = HashSet::new();
                let mut instances = Vec::new();
                for row in rows {
                    let uid: String = row.get("id");
                    if !seen.insert(uid.clone()) {
                        continue;
                    }
                    if let Some(instance) = self.get_by_id(&uid).await? {
                        instances.push(instance);
                    }
                }
                Ok(instances)
            }

            async fn delete(&self, uid: &str) -> Result<()> {
                let stmt = Query::delete()
                    .from_table(Sagas::Table)
                    .and_where(Expr::col(Sagas::Id).eq(uid))
                    .to_owned();
                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::SagaNotFound(uid.to_string()));
                }
                Ok(())
            }
        }
    };
}

fn parse_rfc3339(s: String) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Codec(crate::registry::RegistryError::MalformedEnvelope(e.to_string())))
}

#[cfg(feature = "postgres")]
impl_sql_saga_store!(super::postgres::Postgres, "postgres");
#[cfg(feature = "sqlite")]
impl_sql_saga_store!(super::sqlite::Sqlite, "sqlite");
