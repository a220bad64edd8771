//! Tenant DB Library
//!
//! A multi-engine (PostgreSQL, MySQL, MariaDB, SQLite) database access core
//! for multi-tenant services: one portable SQL dialect, task-scoped tenant
//! routing, transactions, normalized errors, and per-application SQL
//! migrations.

pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod migrate;
pub mod models;

pub use config::{Config, EngineConfig};
pub use db::{Database, Transaction, with_database, with_tenant};
pub use error::{DbError, DbResult, ErrorKind};
pub use models::{Engine, QueryParam, QueryResult};
