//! MySQL and MariaDB adapter.
//!
//! Both engines speak the same wire protocol, so one adapter serves either;
//! the configured engine only changes what callers see through `engine()`.

use super::{Adapter, Client, ClientConn};
use crate::config::EngineConfig;
use crate::db::params::bind_mysql_params;
use crate::db::tenant_pool::{DbPool, TenantPoolManager};
use crate::db::types::RowToJson;
use crate::dialect::NormalizedQuery;
use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, QueryResult};
use sqlx::{Executor, MySqlConnection};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct MySqlAdapter {
    engine: Engine,
    pools: Arc<TenantPoolManager>,
}

impl MySqlAdapter {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            engine: config.engine,
            pools: TenantPoolManager::new(config),
        }
    }
}

impl Adapter for MySqlAdapter {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn pools(&self) -> &Arc<TenantPoolManager> {
        &self.pools
    }

    async fn get_client(&self, database: &str) -> DbResult<Client> {
        let lease = self.pools.acquire(database).await?;
        let DbPool::MySql(pool) = lease.pool() else {
            return Err(DbError::generic(
                codes::CLIENT_MISMATCH,
                format!("{} adapter holds a non-MySQL pool", self.engine),
            ));
        };
        let conn = pool
            .acquire()
            .await
            .map_err(|e| DbError::from_sqlx(self.engine, e).with_meta("database", database))?;
        Ok(Client::new(self.engine, ClientConn::MySql(conn), lease))
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
        run(client.mysql()?, query)
            .await
            .map_err(|e| DbError::from_sqlx(self.engine, e))
    }

    async fn execute_raw(&self, client: &mut Client, sql: &str) -> DbResult<()> {
        debug!(client = %client.id(), sql, "Executing raw statement");
        let conn = client.mysql()?;
        conn.execute(sql)
            .await
            .map(|_| ())
            .map_err(|e| DbError::from_sqlx(self.engine, e))
    }
}

async fn run(
    conn: &mut MySqlConnection,
    query: &NormalizedQuery,
) -> Result<QueryResult, sqlx::Error> {
    if query.returns_rows {
        // Unparameterized SQL uses the text protocol; some statements cannot
        // be prepared at all.
        let rows = if query.params.is_empty() {
            (&mut *conn).fetch_all(query.sql.as_str()).await?
        } else {
            bind_mysql_params(sqlx::query(&query.sql), &query.params)
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
        bind_mysql_params(sqlx::query(&query.sql), &query.params)
            .execute(&mut *conn)
            .await?
    };
    // LAST_INSERT_ID() is 0 when nothing was auto-generated
    let insert_id = if query.is_insert {
        i64::try_from(done.last_insert_id())
            .ok()
            .filter(|id| *id > 0)
    } else {
        None
    };
    Ok(QueryResult::write_result(done.rows_affected(), insert_id))
}
