//! Data models shared across the crate.
//!
//! This module re-exports all model types used by the database layer and the
//! migration runner.

pub mod connection;
pub mod migration;
pub mod query;

// Re-export commonly used types
pub use connection::{Engine, TransactionState};
pub use migration::MigrationRecord;
pub use query::{QueryParam, QueryResult, Row};
