#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;

use modmail_lib::config::Config;
use modmail_lib::db::open_sqlite_pool;
use modmail_lib::legacy::{LegacyMigrator, MemoryLegacyStore};
use modmail_lib::migrate::apply_migrations;
use serde_json::Value;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// A migrated SQLite file plus a config rooted in its own temp directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    pub pool: SqlitePool,
}

impl Fixture {
    pub fn migrator(&self, legacy: Value) -> LegacyMigrator {
        LegacyMigrator::new(
            self.pool.clone(),
            Arc::new(MemoryLegacyStore::from_value(legacy)),
            self.config.clone(),
        )
    }

    /// Same pool, different paths.
    pub fn migrator_with_config(&self, config: Config, legacy: Value) -> LegacyMigrator {
        LegacyMigrator::new(
            self.pool.clone(),
            Arc::new(MemoryLegacyStore::from_value(legacy)),
            config,
        )
    }

    pub fn write_log(&self, name: &str, body: &str) -> PathBuf {
        std::fs::create_dir_all(&self.config.log_dir).unwrap();
        let path = self.config.log_dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    pub async fn count(&self, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(&self.pool).await.unwrap()
    }
}

pub async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = Config::rooted_at(dir.path());
    let pool = open_sqlite_pool(&config.db_path, 4)
        .await
        .expect("open sqlite pool");
    apply_migrations(&pool).await.expect("apply migrations");
    Fixture { dir, config, pool }
}
