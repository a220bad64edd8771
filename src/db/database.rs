//! Query facade.
//!
//! [`Database`] is the whole surface application code sees: `query`,
//! `with_transaction` and `health_check`, each resolved against the tenant
//! binding of the calling scope (see [`crate::db::router`]).

use crate::config::EngineConfig;
use crate::db::adapter::{Adapter, AdapterRegistry, Client, EngineAdapter};
use crate::db::router::TenantRouter;
use crate::dialect::{NormalizedQuery, normalize};
use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, QueryParam, QueryResult, TransactionState};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle to every configured engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    registry: Arc<AdapterRegistry>,
    router: TenantRouter,
}

impl Database {
    pub(crate) fn new(registry: AdapterRegistry) -> Self {
        let registry = Arc::new(registry);
        Self {
            router: TenantRouter::new(Arc::clone(&registry)),
            registry,
        }
    }

    /// Register one adapter per config and initialize them all.
    ///
    /// The first config is the engine used by bindings that name none. Any
    /// engine that cannot be reached fails the whole call.
    pub async fn connect(configs: impl IntoIterator<Item = EngineConfig>) -> DbResult<Self> {
        let mut registry = AdapterRegistry::new();
        for config in configs {
            registry.register(EngineAdapter::from_config(config))?;
        }
        if registry.is_empty() {
            return Err(DbError::generic(
                codes::CONFIG,
                "At least one database engine must be configured",
            ));
        }

        let db = Self::new(registry);
        if let Err(e) = db.registry.init_all().await {
            db.close().await;
            return Err(e);
        }
        info!(engines = ?db.registry.engines(), "Database ready");
        Ok(db)
    }

    /// Close every adapter's pools.
    pub async fn close(&self) {
        self.registry.close_all().await;
    }

    /// Configured engines, default first.
    pub fn engines(&self) -> Vec<Engine> {
        self.registry.engines()
    }

    /// Engine the current binding routes to.
    pub fn engine(&self) -> DbResult<Engine> {
        let (adapter, _) = self.router.resolve()?;
        Ok(adapter.engine())
    }

    /// Run one statement on the bound database.
    ///
    /// An emulated `RETURNING *` runs its insert and re-read on one client in
    /// a short transaction, so the re-read sees exactly the inserted row.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let (adapter, database) = self.router.resolve()?;
        let normalized = normalize(adapter.engine(), sql, params)?;
        if normalized.post_select.is_none() {
            return adapter.pooled_query(&database, &normalized).await;
        }

        let mut client = adapter.get_client(&database).await?;
        let result = insert_returning(&adapter, &mut client, &normalized).await;
        adapter.release_client(client).await;
        result
    }

    /// Run `work` inside one transaction on one client.
    ///
    /// Commits when `work` returns `Ok`, rolls back when it returns `Err`.
    /// A failed rollback is logged and the error from `work` is returned.
    /// The client goes back to its pool either way.
    ///
    /// ```ignore
    /// let id = db
    ///     .with_transaction(|tx| {
    ///         Box::pin(async move {
    ///             let row = tx.q("INSERT INTO users (name) VALUES ($1) RETURNING *", &["ann".into()]).await?;
    ///             Ok::<_, DbError>(row.insert_id)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
    {
        let (adapter, database) = self.router.resolve()?;
        let client = adapter.get_client(&database).await?;
        let mut tx = Transaction::new(adapter, client);

        if let Err(e) = tx.begin().await {
            tx.release().await;
            return Err(e.into());
        }

        let outcome = match work(&mut tx).await {
            Ok(value) => tx.commit().await.map(|()| value).map_err(E::from),
            Err(e) => {
                tx.rollback_quietly().await;
                Err(e)
            }
        };
        tx.release().await;
        outcome
    }

    /// Round trip to the bound database.
    pub async fn health_check(&self) -> DbResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }
}

/// One open transaction, handed to the unit of work in
/// [`Database::with_transaction`].
pub struct Transaction {
    adapter: Arc<EngineAdapter>,
    client: Option<Client>,
    state: TransactionState,
}

impl Transaction {
    fn new(adapter: Arc<EngineAdapter>, client: Client) -> Self {
        Self {
            adapter,
            client: Some(client),
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn engine(&self) -> Engine {
        self.adapter.engine()
    }

    pub fn database(&self) -> Option<&str> {
        self.client.as_ref().map(Client::database)
    }

    /// Run one statement inside the transaction.
    pub async fn q(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        if !self.state.is_active() {
            return Err(DbError::generic(
                codes::TX_STATE,
                format!("Cannot run statements on a transaction in state {:?}", self.state),
            ));
        }
        let normalized = normalize(self.adapter.engine(), sql, params)?;
        let Some(client) = self.client.as_mut() else {
            return Err(released());
        };
        run_normalized(&self.adapter, client, &normalized).await
    }

    fn client_mut(&mut self) -> DbResult<&mut Client> {
        self.client.as_mut().ok_or_else(released)
    }

    async fn begin(&mut self) -> DbResult<()> {
        let adapter = Arc::clone(&self.adapter);
        adapter.begin_transaction(self.client_mut()?).await?;
        self.state = TransactionState::Began;
        debug!(engine = %adapter.engine(), "Transaction began");
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let adapter = Arc::clone(&self.adapter);
        adapter.commit_transaction(self.client_mut()?).await?;
        self.state = TransactionState::Committed;
        debug!(engine = %adapter.engine(), "Transaction committed");
        Ok(())
    }

    async fn rollback_quietly(&mut self) {
        let adapter = Arc::clone(&self.adapter);
        let result = match self.client_mut() {
            Ok(client) => adapter.rollback_transaction(client).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(engine = %adapter.engine(), "Transaction rolled back"),
            Err(e) => warn!(
                engine = %adapter.engine(),
                error = %e,
                "Rollback failed, keeping the original error"
            ),
        }
        self.state = TransactionState::RolledBack;
    }

    async fn release(&mut self) {
        if let Some(client) = self.client.take() {
            self.adapter.release_client(client).await;
        }
        self.state = TransactionState::Released;
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("engine", &self.adapter.engine())
            .field("client", &self.client)
            .field("state", &self.state)
            .finish()
    }
}

fn released() -> DbError {
    DbError::generic(codes::TX_STATE, "Transaction client was already released")
}

/// Insert and re-read inside a short transaction of its own.
async fn insert_returning(
    adapter: &EngineAdapter,
    client: &mut Client,
    query: &NormalizedQuery,
) -> DbResult<QueryResult> {
    adapter.begin_transaction(client).await?;
    match run_normalized(adapter, client, query).await {
        Ok(result) => {
            adapter.commit_transaction(client).await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback) = adapter.rollback_transaction(client).await {
                warn!(error = %rollback, "Rollback failed, keeping the original error");
            }
            Err(e)
        }
    }
}

/// Run a normalized statement and, if present, its `post_select` re-read.
async fn run_normalized(
    adapter: &EngineAdapter,
    client: &mut Client,
    query: &NormalizedQuery,
) -> DbResult<QueryResult> {
    let written = adapter.query_with_client(client, query).await?;
    let Some(post_select) = &query.post_select else {
        return Ok(written);
    };

    if written.affected_rows != Some(1) || written.insert_id.is_none() {
        return Err(DbError::generic(
            codes::RETURNING_UNSUPPORTED,
            format!(
                "RETURNING * on {} needs exactly one inserted row with a generated key; \
                 statement affected {} row(s)",
                adapter.engine(),
                written.affected_rows.unwrap_or(0)
            ),
        ));
    }

    let reread = NormalizedQuery {
        sql: post_select.clone(),
        params: Vec::new(),
        post_select: None,
        returns_rows: true,
        is_insert: false,
    };
    let rows = adapter.query_with_client(client, &reread).await?.rows;
    if rows.is_empty() {
        return Err(DbError::generic(
            codes::RETURNING_UNSUPPORTED,
            format!(
                "RETURNING * on {} could not re-read the inserted row by its generated key",
                adapter.engine()
            ),
        ));
    }
    Ok(QueryResult {
        rows,
        ..written
    })
}
