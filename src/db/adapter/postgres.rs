//! PostgreSQL adapter.

use super::{Adapter, Client, ClientConn};
use crate::config::EngineConfig;
use crate::db::params::bind_postgres_params;
use crate::db::tenant_pool::{DbPool, TenantPoolManager};
use crate::db::types::RowToJson;
use crate::dialect::NormalizedQuery;
use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, QueryResult};
use sqlx::{Executor, PgConnection};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct PostgresAdapter {
    pools: Arc<TenantPoolManager>,
}

impl PostgresAdapter {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            pools: TenantPoolManager::new(config),
        }
    }
}

impl Adapter for PostgresAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn pools(&self) -> &Arc<TenantPoolManager> {
        &self.pools
    }

    async fn get_client(&self, database: &str) -> DbResult<Client> {
        let lease = self.pools.acquire(database).await?;
        let DbPool::Postgres(pool) = lease.pool() else {
            return Err(DbError::generic(
                codes::CLIENT_MISMATCH,
                "PostgreSQL adapter holds a non-PostgreSQL pool",
            ));
        };
        let conn = pool.acquire().await.map_err(|e| {
            DbError::from_sqlx(Engine::Postgres, e).with_meta("database", database)
        })?;
        Ok(Client::new(Engine::Postgres, ClientConn::Postgres(conn), lease))
    }

    async fn query_with_client(
        &self,
        client: &mut Client,
        query: &NormalizedQuery,
    ) -> DbResult<QueryResult> {
        debug!(
            client = %client.id(),
            sql = %query.sql,
            params = query.params.len(),
            "Executing statement"
        );
        run(client.postgres()?, query)
            .await
            .map_err(|e| DbError::from_sqlx(Engine::Postgres, e))
    }

    async fn execute_raw(&self, client: &mut Client, sql: &str) -> DbResult<()> {
        debug!(client = %client.id(), sql, "Executing raw statement");
        let conn = client.postgres()?;
        conn.execute(sql)
            .await
            .map(|_| ())
            .map_err(|e| DbError::from_sqlx(Engine::Postgres, e))
    }
}

async fn run(conn: &mut PgConnection, query: &NormalizedQuery) -> Result<QueryResult, sqlx::Error> {
    if query.returns_rows {
        // Without parameters the statement goes out as simple-protocol text,
        // which also accepts several statements in one string.
        let rows = if query.params.is_empty() {
            (&mut *conn).fetch_all(query.sql.as_str()).await?
        } else {
            bind_postgres_params(sqlx::query(&query.sql), &query.params)
                .fetch_all(&mut *conn)
                .await?
        };
        return Ok(QueryResult::from_rows(
            rows.iter().map(RowToJson::to_json_row).collect(),
        ));
    }

    let done = if query.params.is_empty() {
        (&mut *conn).execute(query.sql.as_str()).await?
    } else {
        bind_postgres_params(sqlx::query(&query.sql), &query.params)
            .execute(&mut *conn)
            .await?
    };
    // No driver-level insert id; callers use RETURNING
    Ok(QueryResult::write_result(done.rows_affected(), None))
}
