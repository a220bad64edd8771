//! Normalized error type for every database operation.
//!
//! Callers never see a raw driver error: each `sqlx::Error` is classified into
//! one of four kinds ([`ErrorKind`]) with a stable `code`, the original message
//! as `detail`, and engine-specific structured fields as `meta`.

use crate::models::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlx::error::{DatabaseError, ErrorKind as SqlxErrorKind};
use thiserror::Error;

/// Symbolic codes for errors that carry no engine-native code.
pub mod codes {
    pub const POOL_TIMEOUT: &str = "E_POOL_TIMEOUT";
    pub const POOL_CLOSED: &str = "E_POOL_CLOSED";
    pub const IO: &str = "E_IO";
    pub const TLS: &str = "E_TLS";
    pub const PROTOCOL: &str = "E_PROTOCOL";
    pub const CONFIG: &str = "E_CONFIG";
    pub const WORKER_CRASHED: &str = "E_WORKER_CRASHED";
    pub const DECODE: &str = "E_DECODE";
    pub const ROW_NOT_FOUND: &str = "E_ROW_NOT_FOUND";
    pub const NO_ROUTE: &str = "E_NO_ROUTE";
    pub const NO_ADAPTER: &str = "E_NO_ADAPTER";
    pub const DUPLICATE_ADAPTER: &str = "E_DUPLICATE_ADAPTER";
    pub const INVALID_DATABASE: &str = "E_INVALID_DATABASE";
    pub const PARAM_INDEX: &str = "E_PARAM_INDEX";
    pub const RETURNING_UNSUPPORTED: &str = "E_RETURNING_UNSUPPORTED";
    pub const TX_STATE: &str = "E_TX_STATE";
    pub const CLIENT_MISMATCH: &str = "E_CLIENT_MISMATCH";
    pub const MIGRATION_IO: &str = "E_MIGRATION_IO";
    pub const UNKNOWN: &str = "E_UNKNOWN";
}

/// The closed set of normalized error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Constraint conflict. The caller may retry with different data.
    UniqueViolation,
    /// Engine unreachable or connection lost.
    Unavailable,
    /// Pool exhaustion or engine busy.
    Timeout,
    /// Anything unclassified.
    Generic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UniqueViolation => "UniqueViolation",
            Self::Unavailable => "Unavailable",
            Self::Timeout => "Timeout",
            Self::Generic => "Generic",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Unique violation: {detail} (code: {code})")]
    UniqueViolation {
        code: String,
        detail: String,
        meta: Option<Map<String, JsonValue>>,
    },

    #[error("Database unavailable: {detail} (code: {code})")]
    Unavailable {
        code: String,
        detail: String,
        meta: Option<Map<String, JsonValue>>,
    },

    #[error("Timeout: {detail} (code: {code})")]
    Timeout {
        code: String,
        detail: String,
        meta: Option<Map<String, JsonValue>>,
    },

    #[error("Database error: {detail} (code: {code})")]
    Generic {
        code: String,
        detail: String,
        meta: Option<Map<String, JsonValue>>,
    },
}

impl DbError {
    /// Create a unique violation error.
    pub fn unique_violation(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UniqueViolation {
            code: code.into(),
            detail: detail.into(),
            meta: None,
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Unavailable {
            code: code.into(),
            detail: detail.into(),
            meta: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Timeout {
            code: code.into(),
            detail: detail.into(),
            meta: None,
        }
    }

    /// Create a generic error.
    pub fn generic(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Generic {
            code: code.into(),
            detail: detail.into(),
            meta: None,
        }
    }

    /// Build an error of the given kind.
    pub fn of_kind(kind: ErrorKind, code: impl Into<String>, detail: impl Into<String>) -> Self {
        match kind {
            ErrorKind::UniqueViolation => Self::unique_violation(code, detail),
            ErrorKind::Unavailable => Self::unavailable(code, detail),
            ErrorKind::Timeout => Self::timeout(code, detail),
            ErrorKind::Generic => Self::generic(code, detail),
        }
    }

    /// Attach one structured field to `meta`.
    pub fn with_meta(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        let meta = match &mut self {
            Self::UniqueViolation { meta, .. }
            | Self::Unavailable { meta, .. }
            | Self::Timeout { meta, .. }
            | Self::Generic { meta, .. } => meta,
        };
        meta.get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UniqueViolation { .. } => ErrorKind::UniqueViolation,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Generic { .. } => ErrorKind::Generic,
        }
    }

    /// Stable code for programmatic branching.
    pub fn code(&self) -> &str {
        match self {
            Self::UniqueViolation { code, .. }
            | Self::Unavailable { code, .. }
            | Self::Timeout { code, .. }
            | Self::Generic { code, .. } => code,
        }
    }

    /// Original message from the engine or driver.
    pub fn detail(&self) -> &str {
        match self {
            Self::UniqueViolation { detail, .. }
            | Self::Unavailable { detail, .. }
            | Self::Timeout { detail, .. }
            | Self::Generic { detail, .. } => detail,
        }
    }

    pub fn meta(&self) -> Option<&Map<String, JsonValue>> {
        match self {
            Self::UniqueViolation { meta, .. }
            | Self::Unavailable { meta, .. }
            | Self::Timeout { meta, .. }
            | Self::Generic { meta, .. } => meta.as_ref(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Normalize a driver error raised while talking to `engine`.
    pub fn from_sqlx(engine: Engine, err: sqlx::Error) -> Self {
        let engine_name = engine.to_string();
        let normalized = match err {
            sqlx::Error::Database(db_err) => classify_database_error(engine, db_err.as_ref()),
            other => classify_driver_error(other),
        };
        normalized.with_meta("engine", engine_name)
    }
}

/// Convert sqlx errors to DbError when the engine is not known.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let engine = engine_of(db_err.as_ref());
                classify_database_error(engine, db_err.as_ref())
                    .with_meta("engine", engine.to_string())
            }
            other => classify_driver_error(other),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Best-effort engine detection from the concrete error type.
fn engine_of(err: &dyn DatabaseError) -> Engine {
    if err
        .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
        .is_some()
    {
        Engine::Postgres
    } else if err
        .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
        .is_some()
    {
        Engine::MySql
    } else {
        Engine::Sqlite
    }
}

/// Classify errors that did not come back from the engine itself.
fn classify_driver_error(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Configuration(msg) => DbError::unavailable(codes::CONFIG, msg.to_string()),
        sqlx::Error::PoolTimedOut => DbError::timeout(
            codes::POOL_TIMEOUT,
            "Timed out waiting for a connection from the pool",
        ),
        sqlx::Error::PoolClosed => {
            DbError::unavailable(codes::POOL_CLOSED, "Connection pool is closed")
        }
        sqlx::Error::Io(io_err) => {
            let detail = format!("I/O error: {}", io_err);
            if io_err.kind() == std::io::ErrorKind::TimedOut {
                DbError::timeout(codes::IO, detail)
            } else {
                DbError::unavailable(codes::IO, detail)
            }
        }
        sqlx::Error::Tls(tls_err) => {
            DbError::unavailable(codes::TLS, format!("TLS error: {}", tls_err))
        }
        sqlx::Error::Protocol(msg) => {
            DbError::unavailable(codes::PROTOCOL, format!("Protocol error: {}", msg))
        }
        sqlx::Error::WorkerCrashed => {
            DbError::unavailable(codes::WORKER_CRASHED, "Database worker crashed")
        }
        sqlx::Error::RowNotFound => DbError::generic(codes::ROW_NOT_FOUND, "No rows returned"),
        sqlx::Error::ColumnDecode { index, source } => DbError::generic(
            codes::DECODE,
            format!("Failed to decode column {}: {}", index, source),
        ),
        sqlx::Error::Decode(source) => {
            DbError::generic(codes::DECODE, format!("Decode error: {}", source))
        }
        other => DbError::generic(codes::UNKNOWN, other.to_string()),
    }
}

/// Classify an error reported by the engine.
fn classify_database_error(engine: Engine, err: &dyn DatabaseError) -> DbError {
    let detail = err.message().to_string();
    let (kind, code) = match engine {
        Engine::Postgres => postgres::classify(err),
        Engine::MySql | Engine::MariaDb => mysql::classify(err),
        Engine::Sqlite => sqlite::classify(err),
    };
    // The driver's own classification wins for constraint conflicts we missed
    let kind = if kind == ErrorKind::Generic && err.kind() == SqlxErrorKind::UniqueViolation {
        ErrorKind::UniqueViolation
    } else {
        kind
    };

    let mut normalized = DbError::of_kind(kind, code, detail.clone());
    if kind == ErrorKind::UniqueViolation {
        if let Some(constraint) = err.constraint() {
            normalized = normalized.with_meta("constraint", constraint);
        }
        if let Some(table) = err.table() {
            normalized = normalized.with_meta("table", table);
        }
        match engine {
            Engine::MySql | Engine::MariaDb => {
                if let Some(key) = mysql::duplicate_key_name(&detail) {
                    normalized = normalized.with_meta("key", key);
                }
            }
            Engine::Sqlite => {
                if let Some(columns) = sqlite::unique_columns(&detail) {
                    normalized = normalized.with_meta("columns", columns);
                }
            }
            Engine::Postgres => {
                if let Some(pg_err) = err.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                    if let Some(pg_detail) = pg_err.detail() {
                        normalized = normalized.with_meta("detail", pg_detail);
                    }
                }
            }
        }
    }
    normalized
}

mod postgres {
    use super::*;

    pub fn classify(err: &dyn DatabaseError) -> (ErrorKind, String) {
        let Some(code) = err.code().map(|c| c.to_string()) else {
            return (ErrorKind::Generic, codes::UNKNOWN.to_string());
        };
        let kind = match code.as_str() {
            "23505" => ErrorKind::UniqueViolation,
            // query_canceled (statement_timeout), lock_not_available
            "57014" | "55P03" => ErrorKind::Timeout,
            // admin/crash shutdown, cannot_connect_now, too_many_connections,
            // invalid authorization, unknown database
            "57P01" | "57P02" | "57P03" | "53300" | "28000" | "28P01" | "3D000" => {
                ErrorKind::Unavailable
            }
            c if c.starts_with("08") => ErrorKind::Unavailable,
            _ => ErrorKind::Generic,
        };
        (kind, code)
    }
}

mod mysql {
    use super::*;

    pub fn classify(err: &dyn DatabaseError) -> (ErrorKind, String) {
        let Some(number) = err
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|e| e.number())
        else {
            let code = err
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| codes::UNKNOWN.to_string());
            return (ErrorKind::Generic, code);
        };
        let kind = match number {
            // ER_DUP_ENTRY, ER_DUP_ENTRY_WITH_KEY_NAME
            1062 | 1586 => ErrorKind::UniqueViolation,
            // ER_LOCK_WAIT_TIMEOUT, ER_QUERY_TIMEOUT
            1205 | 3024 => ErrorKind::Timeout,
            // too many connections, access denied, unknown database,
            // client-side connection failures
            1040 | 1044 | 1045 | 1049 | 2002 | 2003 | 2006 | 2013 => ErrorKind::Unavailable,
            _ => ErrorKind::Generic,
        };
        (kind, number.to_string())
    }

    /// Key name from `Duplicate entry 'x' for key 'users.email'`.
    pub fn duplicate_key_name(message: &str) -> Option<String> {
        let rest = &message[message.rfind("for key ")? + "for key ".len()..];
        let key = rest.trim().trim_matches(|c| c == '\'' || c == '`');
        (!key.is_empty()).then(|| key.to_string())
    }
}

mod sqlite {
    use super::*;

    const SQLITE_BUSY: i64 = 5;
    const SQLITE_LOCKED: i64 = 6;
    const SQLITE_CANTOPEN: i64 = 14;
    const SQLITE_CONSTRAINT_PRIMARYKEY: i64 = 1555;
    const SQLITE_CONSTRAINT_UNIQUE: i64 = 2067;

    pub fn classify(err: &dyn DatabaseError) -> (ErrorKind, String) {
        let Some(code) = err.code().map(|c| c.to_string()) else {
            return (ErrorKind::Generic, codes::UNKNOWN.to_string());
        };
        let Ok(extended) = code.parse::<i64>() else {
            return (ErrorKind::Generic, code);
        };
        let kind = match (extended, extended & 0xff) {
            (SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY, _) => {
                ErrorKind::UniqueViolation
            }
            (_, SQLITE_BUSY | SQLITE_LOCKED) => ErrorKind::Timeout,
            (_, SQLITE_CANTOPEN) => ErrorKind::Unavailable,
            _ => ErrorKind::Generic,
        };
        (kind, code)
    }

    /// Columns from `UNIQUE constraint failed: users.email, users.org`.
    pub fn unique_columns(message: &str) -> Option<Vec<String>> {
        let (_, list) = message.split_once("constraint failed:")?;
        let columns: Vec<String> = list
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        (!columns.is_empty()).then_some(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::unavailable(codes::IO, "connection refused");
        assert!(err.to_string().contains("Database unavailable"));
        assert!(err.to_string().contains("E_IO"));
    }

    #[test]
    fn test_error_accessors() {
        let err = DbError::unique_violation("23505", "duplicate key").with_meta("table", "users");
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);
        assert_eq!(err.code(), "23505");
        assert_eq!(err.detail(), "duplicate key");
        assert_eq!(err.meta().unwrap()["table"], "users");
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout(codes::POOL_TIMEOUT, "x").is_retryable());
        assert!(DbError::unavailable(codes::IO, "x").is_retryable());
        assert!(!DbError::unique_violation("1062", "x").is_retryable());
        assert!(!DbError::generic(codes::UNKNOWN, "x").is_retryable());
    }

    #[test]
    fn test_of_kind_round_trips_kind() {
        for kind in [
            ErrorKind::UniqueViolation,
            ErrorKind::Unavailable,
            ErrorKind::Timeout,
            ErrorKind::Generic,
        ] {
            assert_eq!(DbError::of_kind(kind, "c", "d").kind(), kind);
        }
    }

    #[test]
    fn test_pool_timeout_maps_to_timeout() {
        let err = DbError::from_sqlx(Engine::Postgres, sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), codes::POOL_TIMEOUT);
        assert_eq!(err.meta().unwrap()["engine"], "PostgreSQL");
    }

    #[test]
    fn test_pool_closed_maps_to_unavailable() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DbError::from_sqlx(Engine::MySql, sqlx::Error::Io(io));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.detail().contains("refused"));
    }

    #[test]
    fn test_unclassified_maps_to_generic() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.code(), codes::ROW_NOT_FOUND);
    }

    #[test]
    fn test_mysql_duplicate_key_name() {
        assert_eq!(
            mysql::duplicate_key_name("Duplicate entry 'a@b.c' for key 'users.email'"),
            Some("users.email".to_string())
        );
        assert_eq!(mysql::duplicate_key_name("Something else"), None);
    }

    #[test]
    fn test_sqlite_unique_columns() {
        assert_eq!(
            sqlite::unique_columns("UNIQUE constraint failed: users.email, users.org"),
            Some(vec!["users.email".to_string(), "users.org".to_string()])
        );
        assert_eq!(sqlite::unique_columns("no such table: x"), None);
    }
}
