//! Applies pending migrations through the query facade.

use super::MigrationError;
use super::discover::{MigrationFile, discover, discover_app, natural_cmp};
use crate::db::Database;
use crate::dialect::split_statements;
use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, MigrationRecord, QueryParam};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// `CREATE TABLE IF NOT EXISTS` for the control table on `engine`.
pub fn control_table_ddl(engine: Engine, table: &str) -> String {
    let (text, timestamp) = match engine {
        Engine::Postgres => ("VARCHAR(255)", "TIMESTAMPTZ NOT NULL DEFAULT NOW()"),
        Engine::MySql | Engine::MariaDb => {
            ("VARCHAR(255)", "TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP")
        }
        Engine::Sqlite => ("TEXT", "DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP"),
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         app {text} NOT NULL, \
         id {text} NOT NULL, \
         applied_at {timestamp}, \
         PRIMARY KEY (app, id))"
    )
}

fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Runs migrations against the database bound by the caller's routing scope.
///
/// ```ignore
/// let runner = MigrationRunner::new(db, "migrations", "migrations")?;
/// let summary = with_database("tenant_a", runner.run(None)).await?;
/// ```
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    db: Database,
    root: PathBuf,
    table: String,
}

impl MigrationRunner {
    pub fn new(
        db: Database,
        root: impl Into<PathBuf>,
        table: impl Into<String>,
    ) -> Result<Self, MigrationError> {
        let table = table.into();
        if !valid_table_name(&table) {
            return Err(MigrationError::InvalidTable(table));
        }
        Ok(Self {
            db,
            root: root.into(),
            table,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<(), MigrationError> {
        let engine = self.db.engine()?;
        self.db
            .query(&control_table_ddl(engine, &self.table), &[])
            .await?;
        Ok(())
    }

    /// Control rows recorded for `app`, in natural id order.
    pub async fn applied(&self, app: &str) -> Result<Vec<MigrationRecord>, MigrationError> {
        let sql = format!(
            "SELECT app, id, applied_at FROM {} WHERE app = $1",
            self.table
        );
        let result = self.db.query(&sql, &[QueryParam::from(app)]).await?;
        let mut records: Vec<MigrationRecord> = result
            .rows
            .iter()
            .map(|row| MigrationRecord {
                app: text_column(row.get("app")).unwrap_or_else(|| app.to_string()),
                id: text_column(row.get("id")).unwrap_or_default(),
                applied_at: text_column(row.get("applied_at")),
            })
            .collect();
        records.sort_by(|a, b| natural_cmp(&a.id, &b.id));
        Ok(records)
    }

    /// Pending migrations per app, without applying anything.
    pub async fn status(&self, app: Option<&str>) -> Result<MigrationSummary, MigrationError> {
        self.ensure_table().await?;
        let mut summary = MigrationSummary::default();
        for (app, files) in self.targets(app).await? {
            let pending = self.pending(&app, files).await?;
            summary.apps.push(AppSummary {
                app,
                pending: pending.into_iter().map(|f| f.id).collect(),
                applied: Vec::new(),
                failure: None,
            });
        }
        Ok(summary)
    }

    /// Apply every pending migration of `app`, or of every app when `None`.
    ///
    /// A failing migration ends its app's run; the failure is reported in the
    /// summary and the remaining apps still run.
    pub async fn run(&self, app: Option<&str>) -> Result<MigrationSummary, MigrationError> {
        self.ensure_table().await?;
        let mut summary = MigrationSummary::default();
        for (app, files) in self.targets(app).await? {
            let pending = self.pending(&app, files).await?;
            let mut report = AppSummary {
                app,
                pending: pending.iter().map(|f| f.id.clone()).collect(),
                applied: Vec::new(),
                failure: None,
            };
            if pending.is_empty() {
                debug!(app = %report.app, "Up to date");
            }

            for file in pending {
                match self.apply(&file).await {
                    Ok(()) => {
                        info!(app = %file.app, id = %file.id, "Applied migration");
                        report.applied.push(file.id);
                    }
                    Err(e) => {
                        error!(
                            app = %file.app,
                            id = %file.id,
                            code = %e.code(),
                            error = %e,
                            "Migration failed, skipping the rest of this app"
                        );
                        report.failure = Some(MigrationFailure { id: file.id, error: e });
                        break;
                    }
                }
            }
            summary.apps.push(report);
        }
        info!(
            pending = summary.total_pending(),
            applied = summary.total_applied(),
            failed = summary.has_failures(),
            "Migration run finished"
        );
        Ok(summary)
    }

    async fn targets(
        &self,
        app: Option<&str>,
    ) -> Result<Vec<(String, Vec<MigrationFile>)>, MigrationError> {
        match app {
            Some(app) => Ok(vec![(app.to_string(), discover_app(&self.root, app).await?)]),
            None => discover(&self.root).await,
        }
    }

    async fn pending(
        &self,
        app: &str,
        files: Vec<MigrationFile>,
    ) -> Result<Vec<MigrationFile>, MigrationError> {
        let done: HashSet<String> = self
            .applied(app)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        Ok(files.into_iter().filter(|f| !done.contains(&f.id)).collect())
    }

    /// One file and its control row, all or nothing.
    async fn apply(&self, file: &MigrationFile) -> DbResult<()> {
        let sql = file.read().await.map_err(|e| {
            DbError::generic(codes::MIGRATION_IO, e.to_string())
                .with_meta("path", file.path.display().to_string())
        })?;
        let statements = split_statements(self.db.engine()?, &sql);
        let record = format!("INSERT INTO {} (app, id) VALUES ($1, $2)", self.table);
        let params = vec![
            QueryParam::from(file.app.as_str()),
            QueryParam::from(file.id.as_str()),
        ];
        debug!(
            app = %file.app,
            id = %file.id,
            statements = statements.len(),
            "Applying migration"
        );

        self.db
            .with_transaction(move |tx| {
                Box::pin(async move {
                    for statement in &statements {
                        tx.q(statement, &[]).await?;
                    }
                    tx.q(&record, &params).await?;
                    Ok::<_, DbError>(())
                })
            })
            .await
    }
}

fn text_column(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// The migration that stopped an app's run.
#[derive(Debug)]
pub struct MigrationFailure {
    pub id: String,
    pub error: DbError,
}

/// Outcome for one application.
#[derive(Debug)]
pub struct AppSummary {
    pub app: String,
    /// Ids that were pending when the run started.
    pub pending: Vec<String>,
    /// Ids applied during this run.
    pub applied: Vec<String>,
    pub failure: Option<MigrationFailure>,
}

#[derive(Debug, Default)]
pub struct MigrationSummary {
    pub apps: Vec<AppSummary>,
}

impl MigrationSummary {
    pub fn total_pending(&self) -> usize {
        self.apps.iter().map(|a| a.pending.len()).sum()
    }

    pub fn total_applied(&self) -> usize {
        self.apps.iter().map(|a| a.applied.len()).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.apps.iter().any(|a| a.failure.is_some())
    }

    /// `Err` with the first failure, if any app failed.
    pub fn into_result(self) -> Result<Self, MigrationError> {
        let Some(index) = self.apps.iter().position(|a| a.failure.is_some()) else {
            return Ok(self);
        };
        let mut apps = self.apps;
        let app = apps.swap_remove(index);
        match app.failure {
            Some(failure) => Err(MigrationError::Failed {
                app: app.app,
                id: failure.id,
                source: failure.error,
            }),
            None => Ok(Self { apps }),
        }
    }
}

impl fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for app in &self.apps {
            write!(
                f,
                "{}: pending={} applied={}",
                app.app,
                app.pending.len(),
                app.applied.len()
            )?;
            if let Some(failure) = &app.failure {
                write!(f, " failed at {}: {}", failure.id, failure.error)?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "total: pending={} applied={}",
            self.total_pending(),
            self.total_applied()
        )
    }
}
