//! Database access layer.
//!
//! - `tenant_pool`: lazily created per-tenant pools with an idle reaper
//! - `adapter`: one driver adapter per engine behind a common trait
//! - `router`: task-scoped tenant bindings
//! - `database`: the query facade built on top of the above
//! - `params` / `types`: parameter binding and row decoding

#[macro_use]
pub mod macros;
pub(crate) mod adapter;
pub mod database;
pub mod params;
pub mod router;
pub mod tenant_pool;
pub mod types;

pub use database::{Database, Transaction};
pub use router::{
    Binding, TenantRoute, current_binding, spawn_routed, with_binding, with_database,
    with_tenant,
};
pub use tenant_pool::{DbPool, PoolLease, TenantPoolManager};
