//! Table/column identifiers for the two-table saga schema, plus the DDL
//! used by [`super::run_migrations`].

use sea_query::Iden;

#[derive(Iden)]
pub enum Sagas {
    #[iden = "saga"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "parent_id"]
    ParentId,
    #[iden = "name"]
    Name,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "started_at"]
    StartedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

#[derive(Iden)]
pub enum SagaHistory {
    #[iden = "saga_history"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "saga_id"]
    SagaId,
    #[iden = "name"]
    Name,
    #[iden = "type"]
    Type,
    #[iden = "status"]
    Status,
    #[iden = "payload"]
    Payload,
    #[iden = "description"]
    Description,
    #[iden = "origin_source"]
    OriginSource,
    #[iden = "created_at"]
    CreatedAt,
}

pub const CREATE_SAGA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS saga (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    name TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub const CREATE_SAGA_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS saga_history (
    id TEXT PRIMARY KEY,
    saga_id TEXT NOT NULL REFERENCES saga(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    payload BLOB NOT NULL,
    description TEXT NOT NULL,
    origin_source TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_saga_history_saga_id ON saga_history(saga_id);
"#;
