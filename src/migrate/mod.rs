//! SQL file migrations, tracked per application in a control table.
//!
//! Layout: `<root>/<app>/<n>_<name>.sql`. Files apply in natural order of
//! their names, each in its own transaction together with its control row.
//! A failing file stops its own application only; other applications still
//! run.

mod discover;
mod runner;

pub use discover::{MigrationFile, discover, discover_app, natural_cmp};
pub use runner::{AppSummary, MigrationFailure, MigrationRunner, MigrationSummary, control_table_ddl};

use crate::error::{DbError, codes};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No migrations directory for app '{0}'")]
    UnknownApp(String),

    #[error("Invalid migrations table name '{0}'")]
    InvalidTable(String),

    #[error("Migration {app}/{id} failed: {source}")]
    Failed {
        app: String,
        id: String,
        #[source]
        source: DbError,
    },

    #[error(transparent)]
    Database(#[from] DbError),
}

impl MigrationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable code, matching [`DbError::code`] for database failures.
    pub fn code(&self) -> &str {
        match self {
            Self::Io { .. } | Self::UnknownApp(_) => codes::MIGRATION_IO,
            Self::InvalidTable(_) => codes::CONFIG,
            Self::Failed { source, .. } | Self::Database(source) => source.code(),
        }
    }
}
