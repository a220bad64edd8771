//! Lazy per-tenant connection pools.
//!
//! Every tenant database gets its own sqlx pool, created on first use and
//! closed again once it has sat idle for `tenant_pool_idle_timeout`.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per database name**: single-flight pool creation, so two
//!   concurrent first requests for a tenant never open two pools
//! - **`PoolLease` active tracking**: every borrowed client holds a lease; the
//!   reaper skips pools with live leases
//! - **`Weak` reaper handle**: the cleanup task exits once the manager is dropped
//!
//! # Concurrency Safety
//!
//! - No lock is held across an `.await` that talks to the engine
//! - The reaper re-checks idleness under the write lock before removing a pool
//! - An acquire that races the reaper and finds its pool closed drops the
//!   stale cell and opens a fresh pool

use crate::config::EngineConfig;
use crate::error::{DbError, DbResult, codes};
use crate::models::Engine;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine-specific connection pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    /// MySQL and MariaDB share the driver.
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        dispatch!(DbPool, self, pool => pool.close().await)
    }

    pub fn is_closed(&self) -> bool {
        dispatch!(DbPool, self, pool => pool.is_closed())
    }
}

/// One tenant database's pool and its usage bookkeeping.
pub struct TenantPoolEntry {
    pub pool: DbPool,
    pub database: String,
    /// std lock: never held across an await point
    last_accessed: std::sync::RwLock<Instant>,
    pub created_at: Instant,
    /// Live leases. The reaper skips pools with a non-zero count.
    active_count: AtomicUsize,
}

impl TenantPoolEntry {
    fn new(pool: DbPool, database: String) -> Self {
        let now = Instant::now();
        Self {
            pool,
            database,
            last_accessed: std::sync::RwLock::new(now),
            created_at: now,
            active_count: AtomicUsize::new(0),
        }
    }

    fn increment_active(&self) {
        self.active_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at 0 so a logic error cannot wrap the counter.
    fn decrement_active(&self) {
        let result = self
            .active_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
        if result == Ok(0) {
            warn!(database = %self.database, "Active count underflow detected");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    fn touch(&self) {
        if let Ok(mut last_accessed) = self.last_accessed.write() {
            *last_accessed = Instant::now();
        }
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
            .read()
            .map(|guard| *guard)
            .unwrap_or(self.created_at)
    }

    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.active_count() == 0 && now.saturating_duration_since(self.last_accessed()) > idle_timeout
    }
}

impl std::fmt::Debug for TenantPoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPoolEntry")
            .field("pool", &self.pool)
            .field("database", &self.database)
            .field("created_at", &self.created_at)
            .field("active_count", &self.active_count())
            .finish()
    }
}

/// Keeps a tenant pool marked as in use until dropped.
#[derive(Debug)]
pub struct PoolLease {
    entry: Arc<TenantPoolEntry>,
}

impl PoolLease {
    fn new(entry: Arc<TenantPoolEntry>) -> Self {
        entry.touch();
        entry.increment_active();
        Self { entry }
    }

    pub fn pool(&self) -> &DbPool {
        &self.entry.pool
    }

    pub fn database(&self) -> &str {
        &self.entry.database
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.entry.touch();
        self.entry.decrement_active();
    }
}

type PoolCell = Arc<OnceCell<Arc<TenantPoolEntry>>>;

/// Owns every tenant pool of one engine.
pub struct TenantPoolManager {
    config: EngineConfig,
    pools: TokioRwLock<HashMap<String, PoolCell>>,
    cleanup_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TenantPoolManager {
    /// Create the manager and spawn its idle-pool reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let cleanup_interval = config.pool.tenant_pool_cleanup_interval();
        let idle_timeout = config.pool.tenant_pool_idle_timeout();
        let manager = Arc::new(Self {
            config,
            pools: TokioRwLock::new(HashMap::new()),
            cleanup_handle: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak_manager = Arc::downgrade(&manager);
        let handle = tokio::spawn(async move {
            Self::cleanup_task(weak_manager, cleanup_interval, idle_timeout).await;
        });
        *manager
            .cleanup_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        manager
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lease the pool for `database`, creating it on first use.
    pub async fn acquire(&self, database: &str) -> DbResult<PoolLease> {
        if database.trim().is_empty() {
            return Err(DbError::generic(
                codes::INVALID_DATABASE,
                "Database name cannot be empty",
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }

        loop {
            let cell = {
                let pools = self.pools.read().await;
                pools.get(database).cloned()
            };
            let cell = match cell {
                Some(cell) => cell,
                None => {
                    let mut pools = self.pools.write().await;
                    Arc::clone(pools.entry(database.to_string()).or_default())
                }
            };

            let entry = cell
                .get_or_try_init(|| async {
                    debug!(engine = %self.config.engine, database = %database, "Creating tenant pool");
                    let pool = connect_pool(&self.config, database).await?;
                    Ok::<_, DbError>(Arc::new(TenantPoolEntry::new(pool, database.to_string())))
                })
                .await?;

            if !entry.pool.is_closed() {
                return Ok(PoolLease::new(Arc::clone(entry)));
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(self.closed_error());
            }

            // Reaped between lookup and lease: forget the stale cell and retry
            let mut pools = self.pools.write().await;
            if pools.get(database).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                pools.remove(database);
            }
        }
    }

    /// Number of tenant pools currently open.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Close every pool and stop the reaper. Later acquires fail.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self
            .cleanup_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }

        // Drain under lock, close outside it
        let drained: Vec<_> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };
        for (database, cell) in drained {
            if let Some(entry) = cell.get() {
                info!(engine = %self.config.engine, database = %database, "Closing tenant pool");
                entry.pool.close().await;
            }
        }
    }

    fn closed_error(&self) -> DbError {
        DbError::unavailable(codes::POOL_CLOSED, "Connection pool is closed")
            .with_meta("engine", self.config.engine.to_string())
    }

    /// Remove and close pools idle longer than `idle_timeout`.
    async fn reap_idle(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let candidates: Vec<String> = {
            let pools = self.pools.read().await;
            pools
                .iter()
                .filter(|(_, cell)| cell.get().is_some_and(|e| e.is_idle(now, idle_timeout)))
                .map(|(database, _)| database.clone())
                .collect()
        };

        for database in candidates {
            let removed = {
                let mut pools = self.pools.write().await;
                // Re-check: a lease may have been taken since the scan
                let still_idle = pools
                    .get(&database)
                    .and_then(|cell| cell.get())
                    .is_some_and(|e| e.is_idle(now, idle_timeout));
                if still_idle {
                    pools.remove(&database)
                } else {
                    None
                }
            };

            if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
                info!(engine = %self.config.engine, database = %database, "Closing idle tenant pool");
                entry.pool.close().await;
            }
        }
    }

    async fn cleanup_task(
        weak_manager: Weak<Self>,
        cleanup_interval: Duration,
        idle_timeout: Duration,
    ) {
        let mut interval = tokio::time::interval(cleanup_interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(manager) = weak_manager.upgrade() else {
                debug!("Tenant pool manager dropped, cleanup task exiting");
                return;
            };
            manager.reap_idle(idle_timeout).await;
        }
    }
}

impl std::fmt::Debug for TenantPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPoolManager")
            .field("engine", &self.config.engine)
            .field("endpoint", &self.config.endpoint())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for TenantPoolManager {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.cleanup_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// File backing the SQLite tenant database `database`.
///
/// The configured database maps to its own path. Names that already look like
/// paths are used as given; bare names become `<name>.db` beside the
/// configured database file.
pub fn sqlite_path(configured: &str, database: &str) -> PathBuf {
    let looks_like_path = database.contains('/')
        || database.contains('\\')
        || database == ":memory:"
        || [".db", ".sqlite", ".sqlite3"]
            .iter()
            .any(|ext| database.ends_with(ext));
    if database == configured || looks_like_path {
        return PathBuf::from(database);
    }
    let dir = Path::new(configured)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    dir.join(format!("{}.db", database))
}

/// Open a pool for one tenant database.
async fn connect_pool(config: &EngineConfig, database: &str) -> DbResult<DbPool> {
    let opts = &config.pool;
    let engine = config.engine;
    let to_error = |e: sqlx::Error| DbError::from_sqlx(engine, e).with_meta("database", database);

    match engine {
        Engine::Postgres => {
            let mut options = PgConnectOptions::new()
                .database(database)
                .ssl_mode(if config.ssl {
                    PgSslMode::Require
                } else {
                    PgSslMode::Disable
                });
            if let Some(host) = &config.host {
                options = options.host(host);
            }
            if let Some(port) = config.port {
                options = options.port(port);
            }
            if let Some(user) = &config.user {
                options = options.username(user);
            }
            if let Some(password) = &config.password {
                options = options.password(password);
            }

            let pool = PgPoolOptions::new()
                .min_connections(opts.min_connections_or_default())
                .max_connections(opts.max_connections_or_default(engine))
                .acquire_timeout(opts.acquire_timeout())
                .idle_timeout(Some(opts.idle_timeout()))
                .test_before_acquire(opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(to_error)?;
            Ok(DbPool::Postgres(pool))
        }
        Engine::MySql | Engine::MariaDb => {
            let mut options = MySqlConnectOptions::new()
                .database(database)
                .charset("utf8mb4")
                .ssl_mode(if config.ssl {
                    MySqlSslMode::Required
                } else {
                    MySqlSslMode::Disabled
                });
            if let Some(host) = &config.host {
                options = options.host(host);
            }
            if let Some(port) = config.port {
                options = options.port(port);
            }
            if let Some(user) = &config.user {
                options = options.username(user);
            }
            if let Some(password) = &config.password {
                options = options.password(password);
            }

            let pool = MySqlPoolOptions::new()
                .min_connections(opts.min_connections_or_default())
                .max_connections(opts.max_connections_or_default(engine))
                .acquire_timeout(opts.acquire_timeout())
                .idle_timeout(Some(opts.idle_timeout()))
                .test_before_acquire(opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(to_error)?;
            Ok(DbPool::MySql(pool))
        }
        Engine::Sqlite => {
            let path = sqlite_path(&config.database, database);
            let options = if path.as_os_str() == ":memory:" {
                SqliteConnectOptions::from_str("sqlite::memory:").map_err(to_error)?
            } else {
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
            }
            .foreign_keys(true)
            .busy_timeout(opts.acquire_timeout());

            let pool = SqlitePoolOptions::new()
                .min_connections(opts.min_connections_or_default())
                .max_connections(opts.max_connections_or_default(engine))
                .acquire_timeout(opts.acquire_timeout())
                .idle_timeout(Some(opts.idle_timeout()))
                .test_before_acquire(opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(to_error)?;
            Ok(DbPool::Sqlite(pool))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::error::ErrorKind;

    fn sqlite_config(dir: &Path) -> EngineConfig {
        EngineConfig::sqlite(dir.join("main.db").to_string_lossy().into_owned())
    }

    #[test]
    fn test_sqlite_path_mapping() {
        assert_eq!(
            sqlite_path("data/main.db", "tenant_a"),
            PathBuf::from("data/tenant_a.db")
        );
        assert_eq!(
            sqlite_path("data/main.db", "data/main.db"),
            PathBuf::from("data/main.db")
        );
        assert_eq!(
            sqlite_path("data/main.db", "/tmp/other.sqlite"),
            PathBuf::from("/tmp/other.sqlite")
        );
        assert_eq!(sqlite_path("main.db", "t1"), PathBuf::from("./t1.db"));
        assert_eq!(sqlite_path("main.db", ":memory:"), PathBuf::from(":memory:"));
    }

    #[tokio::test]
    async fn test_acquire_creates_one_pool_per_database() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TenantPoolManager::new(sqlite_config(dir.path()));

        let a1 = manager.acquire("tenant_a").await.unwrap();
        let a2 = manager.acquire("tenant_a").await.unwrap();
        let b = manager.acquire("tenant_b").await.unwrap();

        assert_eq!(manager.pool_count().await, 2);
        assert_eq!(a1.entry.active_count(), 2);
        assert_eq!(b.database(), "tenant_b");
        assert!(dir.path().join("tenant_a.db").exists());

        drop(a1);
        drop(a2);
        assert_eq!(b.entry.active_count(), 1);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_first_acquire_is_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TenantPoolManager::new(sqlite_config(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.acquire("shared").await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(manager.pool_count().await, 1);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_empty_database_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TenantPoolManager::new(sqlite_config(dir.path()));
        let err = manager.acquire("  ").await.unwrap_err();
        assert_eq!(err.code(), codes::INVALID_DATABASE);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_acquire_after_close_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TenantPoolManager::new(sqlite_config(dir.path()));
        manager.acquire("t").await.unwrap();
        manager.close_all().await;

        assert_eq!(manager.pool_count().await, 0);
        let err = manager.acquire("t").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.code(), codes::POOL_CLOSED);
    }

    #[tokio::test]
    async fn test_reaper_skips_leased_and_closes_idle_pools() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TenantPoolManager::new(sqlite_config(dir.path()).with_pool(PoolOptions {
            tenant_pool_idle_timeout_secs: Some(0),
            ..Default::default()
        }));

        let held = manager.acquire("busy").await.unwrap();
        drop(manager.acquire("idle").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.reap_idle(Duration::ZERO).await;
        assert_eq!(manager.pool_count().await, 1);
        assert_eq!(held.database(), "busy");

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.reap_idle(Duration::ZERO).await;
        assert_eq!(manager.pool_count().await, 0);
        manager.close_all().await;
    }
}
