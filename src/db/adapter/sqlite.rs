//! SQLite adapter. Each tenant database is its own file.

use super::{Adapter, Client, ClientConn};
use crate::config::EngineConfig;
use crate::db::params::bind_sqlite_params;
use crate::db::tenant_pool::{DbPool, TenantPoolManager};
use crate::db::types::RowToJson;
use crate::dialect::NormalizedQuery;
use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, QueryResult};
use sqlx::{Executor, SqliteConnection};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct SqliteAdapter {
    pools: Arc<TenantPoolManager>,
}

impl SqliteAdapter {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            pools: TenantPoolManager::new(config),
        }
    }
}

impl Adapter for SqliteAdapter {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    fn pools(&self) -> &Arc<TenantPoolManager> {
        &self.pools
    }

    async fn get_client(&self, database: &str) -> DbResult<Client> {
        let lease = self.pools.acquire(database).await?;
        let DbPool::Sqlite(pool) = lease.pool() else {
            return Err(DbError::generic(
                codes::CLIENT_MISMATCH,
                "SQLite adapter holds a non-SQLite pool",
            ));
        };
        let conn = pool
            .acquire()
            .await
            .map_err(|e| DbError::from_sqlx(Engine::Sqlite, e).with_meta("database", database))?;
        Ok(Client::new(Engine::Sqlite, ClientConn::Sqlite(conn), lease))
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
        run(client.sqlite()?, query)
            .await
            .map_err(|e| DbError::from_sqlx(Engine::Sqlite, e))
    }

    async fn execute_raw(&self, client: &mut Client, sql: &str) -> DbResult<()> {
        debug!(client = %client.id(), sql, "Executing raw statement");
        let conn = client.sqlite()?;
        conn.execute(sql)
            .await
            .map(|_| ())
            .map_err(|e| DbError::from_sqlx(Engine::Sqlite, e))
    }
}

async fn run(
    conn: &mut SqliteConnection,
    query: &NormalizedQuery,
) -> Result<QueryResult, sqlx::Error> {
    if query.returns_rows {
        let rows = bind_sqlite_params(sqlx::query(&query.sql), &query.params)
            .fetch_all(&mut *conn)
            .await?;
        return Ok(QueryResult::from_rows(
            rows.iter().map(RowToJson::to_json_row).collect(),
        ));
    }

    let done = if query.params.is_empty() {
        (&mut *conn).execute(query.sql.as_str()).await?
    } else {
        bind_sqlite_params(sqlx::query(&query.sql), &query.params)
            .execute(&mut *conn)
            .await?
    };
    let insert_id = if query.is_insert && done.rows_affected() > 0 {
        Some(done.last_insert_rowid()).filter(|id| *id > 0)
    } else {
        None
    };
    Ok(QueryResult::write_result(done.rows_affected(), insert_id))
}
