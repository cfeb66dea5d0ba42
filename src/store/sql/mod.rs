//! SQL-backed [`super::SagaStore`] implementations, parameterized over a
//! database backend via [`SqlDatabase`].

mod saga_store;
pub mod schema;

pub use saga_store::SqlSagaStore;

/// Abstracts over a SQL backend's pool type and sea-query dialect.
pub trait SqlDatabase: Send + Sync + 'static {
    type Pool: Clone + Send + Sync;

    fn build_select(stmt: sea_query::SelectStatement) -> String;
    fn build_insert(stmt: sea_query::InsertStatement) -> String;
    fn build_delete(stmt: sea_query::DeleteStatement) -> String;
}

#[cfg(feature = "postgres")]
pub mod postgres {
    //! PostgreSQL database backend.

    use sea_query::PostgresQueryBuilder;
    use sqlx::PgPool;

    pub struct Postgres;

    impl super::SqlDatabase for Postgres {
        type Pool = PgPool;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }
    }

    pub type PostgresSagaStore = super::SqlSagaStore<Postgres>;

    /// Runs the saga/saga_history DDL against `pool`.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(super::schema::CREATE_SAGA_TABLE)
            .execute(pool)
            .await?;
        sqlx::raw_sql(super::schema::CREATE_SAGA_HISTORY_TABLE)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite database backend.

    use sea_query::SqliteQueryBuilder;
    use sqlx::SqlitePool;

    pub struct Sqlite;

    impl super::SqlDatabase for Sqlite {
        type Pool = SqlitePool;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }
    }

    pub type SqliteSagaStore = super::SqlSagaStore<Sqlite>;

    /// Runs the saga/saga_history DDL against `pool`.
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(super::schema::CREATE_SAGA_TABLE)
            .execute(pool)
            .await?;
        sqlx::raw_sql(super::schema::CREATE_SAGA_HISTORY_TABLE)
            .execute(pool)
            .await?;
        Ok(())
    }
}
