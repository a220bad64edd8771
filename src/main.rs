//! tenant-db-migrate - applies per-application SQL migrations to one tenant
//! database.

use clap::Parser;
use std::process::ExitCode;
use tenant_db::config::Config;
use tenant_db::db::{Database, with_database};
use tenant_db::migrate::MigrationRunner;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let engine_config = config.engine_config()?;
    let target = config
        .target
        .clone()
        .unwrap_or_else(|| engine_config.database.clone());

    info!(
        connection = %engine_config,
        target = %target,
        app = ?config.app,
        "Starting tenant-db-migrate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Database::connect([engine_config]).await?;
    let runner = MigrationRunner::new(
        db.clone(),
        config.migrations_dir.clone(),
        config.migrations_table.clone(),
    )?;

    let app = config.app.as_deref();
    let outcome = with_database(target, async {
        if config.status {
            runner.status(app).await
        } else {
            runner.run(app).await
        }
    })
    .await;
    db.close().await;

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            error!(code = %e.code(), error = %e, "Migration run aborted");
            return Err(e.into());
        }
    };

    if config.status {
        for app in &summary.apps {
            for id in &app.pending {
                println!("{}/{}", app.app, id);
            }
        }
    }
    println!("{}", summary);

    if summary.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
