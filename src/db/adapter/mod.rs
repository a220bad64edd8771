//! Driver adapters.
//!
//! One adapter per configured engine owns that engine's tenant pools and runs
//! already-normalized statements on pooled connections:
//! - `postgres`: PostgreSQL
//! - `mysql`: MySQL and MariaDB (shared driver, separate engine flavour)
//! - `sqlite`: SQLite, one database file per tenant
//!
//! Engine dispatch goes through the closed [`EngineAdapter`] enum.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use crate::config::EngineConfig;
use crate::db::tenant_pool::{PoolLease, TenantPoolManager};
use crate::dialect::NormalizedQuery;
use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, QueryResult};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, MySqlConnection, PgConnection, Postgres, Sqlite, SqliteConnection};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Uniform low-level contract every engine adapter fulfils.
///
/// Statements reach the adapter already rewritten for its engine; the adapter
/// only decides how to send them (raw text or prepared) and how to decode the
/// outcome.
#[allow(async_fn_in_trait)]
pub trait Adapter: Send + Sync {
    fn engine(&self) -> Engine;

    fn pools(&self) -> &Arc<TenantPoolManager>;

    /// Borrow a client from `database`'s pool.
    async fn get_client(&self, database: &str) -> DbResult<Client>;

    /// Run one statement on a borrowed client.
    async fn query_with_client(
        &self,
        client: &mut Client,
        query: &NormalizedQuery,
    ) -> DbResult<QueryResult>;

    /// Send `sql` as raw text, discarding any result.
    async fn execute_raw(&self, client: &mut Client, sql: &str) -> DbResult<()>;

    /// Open the configured database's pool and verify it with a round trip.
    async fn init(&self) -> DbResult<()> {
        let config = self.pools().config();
        let mut client = self.get_client(&config.database).await?;
        let result = self.execute_raw(&mut client, "SELECT 1").await;
        self.release_client(client).await;
        result?;
        info!(
            engine = %self.engine(),
            endpoint = %config.endpoint(),
            database = %config.database,
            "Adapter initialized"
        );
        Ok(())
    }

    /// Close every tenant pool and stop the idle-pool reaper.
    async fn close(&self) {
        self.pools().close_all().await;
        info!(engine = %self.engine(), "Adapter closed");
    }

    /// Return the client to its pool.
    ///
    /// A client still inside a transaction is rolled back first; if that
    /// fails its connection is closed instead of pooled.
    async fn release_client(&self, mut client: Client) {
        if client.in_transaction() {
            if let Err(e) = self.rollback_transaction(&mut client).await {
                warn!(client = %client.id(), error = %e, "Rollback on release failed");
            }
        }
        debug!(client = %client.id(), database = %client.database(), "Client released");
        drop(client);
    }

    /// Acquire, run one statement, release.
    async fn pooled_query(
        &self,
        database: &str,
        query: &NormalizedQuery,
    ) -> DbResult<QueryResult> {
        let mut client = self.get_client(database).await?;
        let result = self.query_with_client(&mut client, query).await;
        self.release_client(client).await;
        result
    }

    async fn begin_transaction(&self, client: &mut Client) -> DbResult<()> {
        self.execute_raw(client, self.engine().begin_statement())
            .await?;
        client.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&self, client: &mut Client) -> DbResult<()> {
        self.execute_raw(client, "COMMIT").await?;
        client.in_transaction = false;
        Ok(())
    }

    async fn rollback_transaction(&self, client: &mut Client) -> DbResult<()> {
        self.execute_raw(client, "ROLLBACK").await?;
        client.in_transaction = false;
        Ok(())
    }
}

/// A pooled connection of one of the driver families.
pub(crate) enum ClientConn {
    Postgres(PoolConnection<Postgres>),
    MySql(PoolConnection<MySql>),
    Sqlite(PoolConnection<Sqlite>),
}

impl ClientConn {
    /// Take the connection out of its pool and close it in the background.
    fn detach_and_close(self) {
        dispatch!(ClientConn, self, conn => {
            let raw = conn.detach();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = raw.close().await {
                        debug!(error = %e, "Closing detached connection failed");
                    }
                });
            }
        })
    }
}

/// One borrowed connection, held exclusively by its user.
///
/// Dropped without [`Adapter::release_client`] it still goes back to the pool,
/// unless a transaction is open: then the connection is detached and closed
/// so no other caller can inherit the half-done transaction.
pub struct Client {
    id: Uuid,
    engine: Engine,
    database: String,
    in_transaction: bool,
    conn: Option<ClientConn>,
    /// Dropped after `conn`; keeps the tenant pool from being reaped.
    _lease: PoolLease,
}

impl Client {
    pub(crate) fn new(engine: Engine, conn: ClientConn, lease: PoolLease) -> Self {
        let client = Self {
            id: Uuid::new_v4(),
            engine,
            database: lease.database().to_string(),
            in_transaction: false,
            conn: Some(conn),
            _lease: lease,
        };
        debug!(client = %client.id, engine = %engine, database = %client.database, "Client acquired");
        client
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn postgres(&mut self) -> DbResult<&mut PgConnection> {
        let (id, engine) = (self.id, self.engine);
        match self.conn.as_mut() {
            Some(ClientConn::Postgres(conn)) => Ok(&mut **conn),
            _ => Err(mismatch(id, engine, "PostgreSQL")),
        }
    }

    pub(crate) fn mysql(&mut self) -> DbResult<&mut MySqlConnection> {
        let (id, engine) = (self.id, self.engine);
        match self.conn.as_mut() {
            Some(ClientConn::MySql(conn)) => Ok(&mut **conn),
            _ => Err(mismatch(id, engine, "MySQL")),
        }
    }

    pub(crate) fn sqlite(&mut self) -> DbResult<&mut SqliteConnection> {
        let (id, engine) = (self.id, self.engine);
        match self.conn.as_mut() {
            Some(ClientConn::Sqlite(conn)) => Ok(&mut **conn),
            _ => Err(mismatch(id, engine, "SQLite")),
        }
    }
}

fn mismatch(id: Uuid, engine: Engine, wanted: &str) -> DbError {
    DbError::generic(
        codes::CLIENT_MISMATCH,
        format!("Client {} holds a {} connection, not {}", id, engine, wanted),
    )
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("database", &self.database)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Some(conn) = self.conn.take() {
            warn!(
                client = %self.id,
                database = %self.database,
                "Client dropped inside a transaction, closing its connection"
            );
            conn.detach_and_close();
        }
    }
}

/// Closed set of adapters, one variant per driver family.
#[derive(Debug)]
pub enum EngineAdapter {
    Postgres(PostgresAdapter),
    MySql(MySqlAdapter),
    Sqlite(SqliteAdapter),
}

impl EngineAdapter {
    /// Build the adapter for `config.engine`. Pools open lazily.
    pub fn from_config(config: EngineConfig) -> Self {
        match config.engine {
            Engine::Postgres => Self::Postgres(PostgresAdapter::new(config)),
            Engine::MySql | Engine::MariaDb => Self::MySql(MySqlAdapter::new(config)),
            Engine::Sqlite => Self::Sqlite(SqliteAdapter::new(config)),
        }
    }
}

impl Adapter for EngineAdapter {
    fn engine(&self) -> Engine {
        dispatch!(EngineAdapter, self, a => a.engine())
    }

    fn pools(&self) -> &Arc<TenantPoolManager> {
        dispatch!(EngineAdapter, self, a => a.pools())
    }

    async fn get_client(&self, database: &str) -> DbResult<Client> {
        dispatch!(EngineAdapter, self, a => a.get_client(database).await)
    }

    async fn query_with_client(
        &self,
        client: &mut Client,
        query: &NormalizedQuery,
    ) -> DbResult<QueryResult> {
        dispatch!(EngineAdapter, self, a => a.query_with_client(client, query).await)
    }

    async fn execute_raw(&self, client: &mut Client, sql: &str) -> DbResult<()> {
        dispatch!(EngineAdapter, self, a => a.execute_raw(client, sql).await)
    }
}

/// Exactly one adapter per engine for the life of the process.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    /// Registration order; the first adapter serves bindings without an engine.
    adapters: Vec<Arc<EngineAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter. A second adapter for the same engine is rejected.
    pub fn register(&mut self, adapter: EngineAdapter) -> DbResult<()> {
        let engine = adapter.engine();
        if self.adapters.iter().any(|a| a.engine() == engine) {
            return Err(DbError::generic(
                codes::DUPLICATE_ADAPTER,
                format!("An adapter for {} is already registered", engine),
            ));
        }
        self.adapters.push(Arc::new(adapter));
        Ok(())
    }

    pub fn get(&self, engine: Engine) -> DbResult<Arc<EngineAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.engine() == engine)
            .cloned()
            .ok_or_else(|| {
                DbError::generic(
                    codes::NO_ADAPTER,
                    format!("No adapter registered for {}", engine),
                )
            })
    }

    pub fn default_engine(&self) -> Option<Engine> {
        self.adapters.first().map(|a| a.engine())
    }

    pub fn engines(&self) -> Vec<Engine> {
        self.adapters.iter().map(|a| a.engine()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Initialize every adapter, failing on the first that cannot connect.
    pub async fn init_all(&self) -> DbResult<()> {
        for adapter in &self.adapters {
            adapter.init().await?;
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for adapter in &self.adapters {
            adapter.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::normalize;
    use crate::error::ErrorKind;

    fn sqlite_adapter(dir: &tempfile::TempDir) -> EngineAdapter {
        let path = dir.path().join("main.db");
        EngineAdapter::from_config(EngineConfig::sqlite(path.to_string_lossy().into_owned()))
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AdapterRegistry::new();
        registry.register(sqlite_adapter(&dir)).unwrap();

        let err = registry.register(sqlite_adapter(&dir)).unwrap_err();
        assert_eq!(err.code(), codes::DUPLICATE_ADAPTER);
        assert_eq!(registry.engines(), vec![Engine::Sqlite]);
        assert_eq!(registry.default_engine(), Some(Engine::Sqlite));
    }

    #[tokio::test]
    async fn test_registry_unknown_engine() {
        let registry = AdapterRegistry::new();
        let err = registry.get(Engine::Postgres).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.code(), codes::NO_ADAPTER);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = sqlite_adapter(&dir);
        adapter.init().await.unwrap();
        adapter.init().await.unwrap();
        assert_eq!(adapter.pools().pool_count().await, 1);
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_pooled_query_and_transaction_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = sqlite_adapter(&dir);
        let create = normalize(Engine::Sqlite, "CREATE TABLE t (v INTEGER)", &[]).unwrap();
        adapter.pooled_query("tenant", &create).await.unwrap();

        let mut client = adapter.get_client("tenant").await.unwrap();
        adapter.begin_transaction(&mut client).await.unwrap();
        assert!(client.in_transaction());
        let insert = normalize(Engine::Sqlite, "INSERT INTO t (v) VALUES (1)", &[]).unwrap();
        let result = adapter.query_with_client(&mut client, &insert).await.unwrap();
        assert_eq!(result.affected_rows, Some(1));
        assert_eq!(result.insert_id, Some(1));
        adapter.rollback_transaction(&mut client).await.unwrap();
        assert!(!client.in_transaction());
        adapter.release_client(client).await;

        let count = normalize(Engine::Sqlite, "SELECT COUNT(*) AS n FROM t", &[]).unwrap();
        let result = adapter.pooled_query("tenant", &count).await.unwrap();
        assert_eq!(result.scalar("n"), Some(&serde_json::json!(0)));
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_client_hands_out_only_its_own_connection() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = sqlite_adapter(&dir);
        let mut client = adapter.get_client("tenant").await.unwrap();

        assert!(client.sqlite().is_ok());
        let err = client.postgres().unwrap_err();
        assert_eq!(err.code(), codes::CLIENT_MISMATCH);
        assert!(err.detail().contains("SQLite"), "{}", err.detail());
        assert_eq!(client.mysql().unwrap_err().code(), codes::CLIENT_MISMATCH);

        adapter.release_client(client).await;
        adapter.close().await;
    }

    #[tokio::test]
    async fn test_dropped_client_in_transaction_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = sqlite_adapter(&dir);
        let create = normalize(Engine::Sqlite, "CREATE TABLE t (v INTEGER)", &[]).unwrap();
        adapter.pooled_query("tenant", &create).await.unwrap();

        {
            let mut client = adapter.get_client("tenant").await.unwrap();
            adapter.begin_transaction(&mut client).await.unwrap();
            let insert = normalize(Engine::Sqlite, "INSERT INTO t (v) VALUES (1)", &[]).unwrap();
            adapter.query_with_client(&mut client, &insert).await.unwrap();
            // Dropped mid-transaction
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let count = normalize(Engine::Sqlite, "SELECT COUNT(*) AS n FROM t", &[]).unwrap();
        let result = adapter.pooled_query("tenant", &count).await.unwrap();
        assert_eq!(result.scalar("n"), Some(&serde_json::json!(0)));
        adapter.close().await;
    }
}
