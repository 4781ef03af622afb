use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::db::open_sqlite_pool;
use crate::legacy::migrator::should_migrate;
use crate::legacy::{JsonDocStore, LegacyMigrator, MigrationSummary};
use crate::migrate::apply_migrations;
use crate::{AppError, AppResult};

const POOL_MAX_CONNECTIONS: u32 = 8;

/// Open the target database, bring its schema up to date and build a
/// migrator over the configured legacy document.
pub async fn open_migrator(config: &Config) -> AppResult<LegacyMigrator> {
    let pool = open_sqlite_pool(&config.db_path, POOL_MAX_CONNECTIONS).await?;
    apply_migrations(&pool).await.map_err(|err| {
        AppError::from(err)
            .with_context("operation", "apply_migrations")
            .with_context("db_path", config.db_path.display().to_string())
    })?;
    let store = Arc::new(JsonDocStore::open(&config.legacy_db_path).await?);
    Ok(LegacyMigrator::new(pool, store, config.clone()))
}

/// Gate check for the configured inputs. Leaves the target database alone.
pub async fn legacy_pending(config: &Config) -> AppResult<bool> {
    let store = JsonDocStore::open(&config.legacy_db_path).await?;
    should_migrate(&store, config).await
}

/// Startup hook: migrate legacy data when the gate says it is still pending.
///
/// Returns `None` when nothing had to be done.
pub async fn run_startup_migration(config: &Config) -> AppResult<Option<MigrationSummary>> {
    let migrator = open_migrator(config).await?;
    if !migrator.should_migrate().await? {
        migrator.pool().close().await;
        return Ok(None);
    }

    info!(
        target: "modmail",
        event = "legacy_migration_begin",
        data_dir = %config.data_dir.display(),
        log_dir = %config.log_dir.display()
    );
    let result = migrator.migrate().await;
    migrator.pool().close().await;
    result.map(Some)
}
