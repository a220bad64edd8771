//! Tenant context routing.
//!
//! The database a query talks to is carried by a task-local binding installed
//! for the duration of one future. Scopes nest with stack semantics: the inner
//! binding shadows the outer one and the outer one is back in effect once the
//! inner future completes, fails, panics, or is dropped. Sibling futures and
//! spawned tasks never observe each other's binding.
//!
//! ```ignore
//! router::with_database("tenant_42", async {
//!     db.query("SELECT * FROM users", &[]).await
//! })
//! .await
//! ```

use crate::db::adapter::{AdapterRegistry, EngineAdapter};
use crate::error::{DbError, DbResult, codes};
use crate::models::Engine;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

tokio::task_local! {
    static BINDING: Binding;
}

/// The routing target active inside one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// `None` routes to the first configured engine.
    pub engine: Option<Engine>,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Binding {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            engine: None,
            database: database.into(),
            tenant_id: None,
        }
    }

    /// Pin the binding to one engine.
    pub fn on_engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }
}

/// Tenant identity resolved upstream, paired with the database that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRoute {
    pub tenant_id: String,
    pub database_name: String,
}

impl TenantRoute {
    pub fn new(tenant_id: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            database_name: database_name.into(),
        }
    }
}

/// Run `fut` with `binding` installed.
pub async fn with_binding<F: Future>(binding: Binding, fut: F) -> F::Output {
    BINDING.scope(binding, fut).await
}

/// Run `fut` routed to the tenant's database, on the enclosing engine.
pub async fn with_tenant<F: Future>(route: TenantRoute, fut: F) -> F::Output {
    let binding = Binding {
        engine: inherited_engine(),
        database: route.database_name,
        tenant_id: Some(route.tenant_id),
    };
    with_binding(binding, fut).await
}

/// Run `fut` routed to `database`, on the enclosing engine.
pub async fn with_database<F: Future>(database: impl Into<String>, fut: F) -> F::Output {
    let binding = Binding {
        engine: inherited_engine(),
        database: database.into(),
        tenant_id: None,
    };
    with_binding(binding, fut).await
}

/// The binding of the innermost enclosing scope, if any.
pub fn current_binding() -> Option<Binding> {
    BINDING.try_with(Clone::clone).ok()
}

fn inherited_engine() -> Option<Engine> {
    BINDING.try_with(|b| b.engine).ok().flatten()
}

/// Spawn `fut` on the runtime carrying the caller's binding.
///
/// Plain `tokio::spawn` starts the task unrouted.
pub fn spawn_routed<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current_binding() {
        Some(binding) => tokio::spawn(BINDING.scope(binding, fut)),
        None => tokio::spawn(fut),
    }
}

/// Resolves the current binding to an adapter and a database name.
#[derive(Debug, Clone)]
pub(crate) struct TenantRouter {
    registry: Arc<AdapterRegistry>,
}

impl TenantRouter {
    pub(crate) fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }

    pub(crate) fn resolve(&self) -> DbResult<(Arc<EngineAdapter>, String)> {
        let binding = current_binding().ok_or_else(|| {
            DbError::generic(
                codes::NO_ROUTE,
                "No tenant database bound; wrap the call in with_tenant or with_database",
            )
        })?;
        if binding.database.trim().is_empty() {
            return Err(DbError::generic(
                codes::INVALID_DATABASE,
                "Bound database name is empty",
            ));
        }
        let engine = match binding.engine.or_else(|| self.registry.default_engine()) {
            Some(engine) => engine,
            None => {
                return Err(DbError::generic(
                    codes::NO_ADAPTER,
                    "No database engine is configured",
                ));
            }
        };
        let adapter = self.registry.get(engine)?;
        Ok((adapter, binding.database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::time::Duration;

    fn database() -> Option<String> {
        current_binding().map(|b| b.database)
    }

    #[tokio::test]
    async fn test_unbound_outside_scope() {
        assert_eq!(current_binding(), None);
    }

    #[tokio::test]
    async fn test_nested_scopes_restore() {
        with_database("outer", async {
            assert_eq!(database().as_deref(), Some("outer"));
            with_database("inner", async {
                assert_eq!(database().as_deref(), Some("inner"));
            })
            .await;
            assert_eq!(database().as_deref(), Some("outer"));
        })
        .await;
        assert_eq!(database(), None);
    }

    #[tokio::test]
    async fn test_scope_restores_after_error() {
        with_database("outer", async {
            let result: Result<(), &str> = with_database("inner", async { Err("boom") }).await;
            assert!(result.is_err());
            assert_eq!(database().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_scope_restores_after_cancellation() {
        with_database("outer", async {
            let slow = with_database("inner", tokio::time::sleep(Duration::from_secs(60)));
            let timed_out = tokio::time::timeout(Duration::from_millis(10), slow).await;
            assert!(timed_out.is_err());
            assert_eq!(database().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_tenant_route_inherits_engine() {
        let binding = Binding::new("base").on_engine(Engine::Sqlite);
        with_binding(binding, async {
            with_tenant(TenantRoute::new("acme", "acme_db"), async {
                let current = current_binding().unwrap();
                assert_eq!(current.engine, Some(Engine::Sqlite));
                assert_eq!(current.database, "acme_db");
                assert_eq!(current.tenant_id.as_deref(), Some("acme"));
            })
            .await;
        })
        .await;
    }

    #[tokio::test]
    async fn test_interleaved_scopes_are_isolated() {
        let work = |name: &'static str| {
            with_database(name, async move {
                for _ in 0..20 {
                    tokio::task::yield_now().await;
                    assert_eq!(database().as_deref(), Some(name));
                }
                name
            })
        };
        let (a, b, c) = tokio::join!(work("a"), work("b"), work("c"));
        assert_eq!((a, b, c), ("a", "b", "c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_tasks_are_isolated() {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                tokio::spawn(with_database(format!("tenant_{i}"), async move {
                    for _ in 0..10 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        assert_eq!(database(), Some(format!("tenant_{i}")));
                    }
                }))
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_spawn_does_not_inherit() {
        with_database("outer", async {
            let plain = tokio::spawn(async { database() }).await.unwrap();
            assert_eq!(plain, None);

            let routed = spawn_routed(async { database() }).await.unwrap();
            assert_eq!(routed.as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = AdapterRegistry::new();
        let path = dir.path().join("main.db");
        registry
            .register(EngineAdapter::from_config(EngineConfig::sqlite(
                path.to_string_lossy().into_owned(),
            )))
            .unwrap();
        let router = TenantRouter::new(Arc::new(registry));

        let err = router.resolve().unwrap_err();
        assert_eq!(err.code(), codes::NO_ROUTE);

        let err = with_database("  ", async { router.resolve() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_DATABASE);

        let binding = Binding::new("x").on_engine(Engine::Postgres);
        let err = with_binding(binding, async { router.resolve() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::NO_ADAPTER);

        let (adapter, db) = with_database("tenant", async { router.resolve() })
            .await
            .unwrap();
        assert_eq!(db, "tenant");
        assert_eq!(crate::db::adapter::Adapter::engine(&*adapter), Engine::Sqlite);
    }
}
