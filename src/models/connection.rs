//! Connection-related data models.
//!
//! This module defines the supported engines, the per-engine dialect facts the
//! rest of the crate branches on, and the transaction lifecycle states.

use serde::{Deserialize, Serialize};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    MySql,
    MariaDb,
    Sqlite,
}

impl Engine {
    /// All engines, in registry order.
    pub const ALL: [Engine; 4] = [
        Engine::Postgres,
        Engine::MySql,
        Engine::MariaDb,
        Engine::Sqlite,
    ];

    /// Parse the engine from a connection string scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("mysql://") {
            Some(Self::MySql)
        } else if lower.starts_with("mariadb://") {
            Some(Self::MariaDb)
        } else if lower.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Parse the engine from a bare name (`--engine postgres`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "mysql" => Some(Self::MySql),
            "mariadb" | "maria" => Some(Self::MariaDb),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Get the display name for this engine.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::MariaDb => "MariaDB",
            Self::Sqlite => "SQLite",
        }
    }

    /// Get the default port for this engine.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql | Self::MariaDb => Some(3306),
            Self::Sqlite => None,
        }
    }

    /// True for the engine whose driver takes `$1, $2, ...` natively.
    pub fn uses_numbered_placeholders(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// True if `INSERT ... RETURNING *` can be sent as written.
    pub fn supports_returning(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// True if a `;`-separated body can be sent in one call.
    pub fn accepts_multi_statement(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// True if the engine treats `\` as an escape inside string literals.
    pub fn backslash_escapes(&self) -> bool {
        matches!(self, Self::MySql | Self::MariaDb)
    }

    /// Engine spelling of the current timestamp.
    pub fn now_function(&self) -> &'static str {
        match self {
            Self::Postgres => "NOW()",
            Self::MySql | Self::MariaDb | Self::Sqlite => "CURRENT_TIMESTAMP",
        }
    }

    /// Statement that opens a transaction.
    pub fn begin_statement(&self) -> &'static str {
        match self {
            Self::Postgres => "BEGIN",
            Self::MySql | Self::MariaDb => "START TRANSACTION",
            // Take the write lock up front so two writers cannot deadlock on upgrade
            Self::Sqlite => "BEGIN IMMEDIATE",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Lifecycle of one `with_transaction` unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Idle,
    Began,
    Committed,
    RolledBack,
    /// The client went back to its pool; terminal.
    Released,
}

impl TransactionState {
    /// Check if statements may still run against the client.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Began)
    }

    /// Check if the transaction has ended (committed, rolled back, or released).
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Released)
    }
}
