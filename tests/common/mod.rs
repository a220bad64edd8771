//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::path::Path;
use tempfile::TempDir;
use tenant_db::{Database, EngineConfig};

/// SQLite config whose default database lives in `dir`; tenant databases
/// become sibling files.
pub fn sqlite_config(dir: &TempDir) -> EngineConfig {
    let path = dir.path().join("main.db");
    EngineConfig::sqlite(path.to_string_lossy().into_owned())
}

pub async fn sqlite_db(dir: &TempDir) -> Database {
    Database::connect([sqlite_config(dir)])
        .await
        .expect("SQLite database should open")
}

/// Server config from `var`, or `None` (with a note) when unset.
pub fn server_config(var: &str) -> Option<EngineConfig> {
    match std::env::var(var) {
        Ok(url) => Some(EngineConfig::parse(&url).expect("test URL should parse")),
        Err(_) => {
            eprintln!("Skipping test: {} not set", var);
            None
        }
    }
}

pub fn write_migration(root: &Path, app: &str, name: &str, sql: &str) {
    let dir = root.join(app);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), sql).unwrap();
}

/// Table name unique to one test run.
pub fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
