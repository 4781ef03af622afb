use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CONFIG_INVALID, CONFIG_PARSE};
use crate::{AppError, AppResult};

pub const CONFIG_ENV: &str = "MODMAIL_CONFIG";
pub const DATA_DIR_ENV: &str = "MODMAIL_DATA_DIR";
pub const LOG_DIR_ENV: &str = "MODMAIL_LOG_DIR";
pub const DB_PATH_ENV: &str = "MODMAIL_DB_PATH";
pub const LEGACY_DB_ENV: &str = "MODMAIL_LEGACY_DB";
pub const MIGRATION_CONCURRENCY_ENV: &str = "MODMAIL_MIGRATION_CONCURRENCY";

/// Sentinel written once the legacy migration has run.
pub const LEGACY_MARKER_FILE: &str = ".migrated_legacy";
pub const DEFAULT_MIGRATION_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub app_root: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub legacy_db_path: PathBuf,
    /// Upper bound on in-flight record operations within one category.
    pub migration_concurrency: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    legacy_db_path: Option<PathBuf>,
    migration_concurrency: Option<usize>,
}

impl Config {
    /// Defaults relative to `app_root`: `db/` for data, `logs/` for transcripts.
    pub fn rooted_at(app_root: impl Into<PathBuf>) -> Self {
        let app_root = app_root.into();
        let data_dir = app_root.join("db");
        Self {
            log_dir: app_root.join("logs"),
            db_path: data_dir.join("data.sqlite"),
            legacy_db_path: data_dir.join("data.json"),
            data_dir,
            app_root,
            migration_concurrency: DEFAULT_MIGRATION_CONCURRENCY,
        }
    }

    /// Defaults rooted at the working directory, then the config file named by
    /// `config_file` or `MODMAIL_CONFIG`, then `MODMAIL_*` overrides.
    pub fn load(config_file: Option<&Path>) -> AppResult<Self> {
        let app_root = std::env::current_dir().map_err(|err| {
            AppError::from(err).with_context("operation", "config_resolve_app_root")
        })?;
        let env_file = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let file = config_file.map(Path::to_path_buf).or(env_file);
        Self::resolve(app_root, file.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn resolve<F>(app_root: PathBuf, config_file: Option<&Path>, env: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::rooted_at(app_root);
        if let Some(path) = config_file {
            config.apply_file(path)?;
        }
        config.apply_env(env)?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> AppResult<()> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "config_read")
                .with_context("path", path.display().to_string())
        })?;
        let file: ConfigFile = serde_json::from_str(&raw).map_err(|err| {
            AppError::new(CONFIG_PARSE, "Configuration file could not be parsed.")
                .with_context("path", path.display().to_string())
                .with_cause(AppError::from(err))
        })?;

        // A new data dir moves the files that default into it.
        if let Some(dir) = file.data_dir {
            self.set_data_dir(self.absolute(dir));
        }
        if let Some(dir) = file.log_dir {
            self.log_dir = self.absolute(dir);
        }
        if let Some(db) = file.db_path {
            self.db_path = self.absolute(db);
        }
        if let Some(legacy) = file.legacy_db_path {
            self.legacy_db_path = self.absolute(legacy);
        }
        if let Some(limit) = file.migration_concurrency {
            self.migration_concurrency = limit.max(1);
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, env: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = var(DATA_DIR_ENV) {
            self.set_data_dir(self.absolute(dir.into()));
        }
        if let Some(dir) = var(LOG_DIR_ENV) {
            self.log_dir = self.absolute(dir.into());
        }
        if let Some(db) = var(DB_PATH_ENV) {
            self.db_path = self.absolute(db.into());
        }
        if let Some(legacy) = var(LEGACY_DB_ENV) {
            self.legacy_db_path = self.absolute(legacy.into());
        }
        if let Some(raw) = var(MIGRATION_CONCURRENCY_ENV) {
            let limit: usize = raw.trim().parse().map_err(|_| {
                AppError::new(CONFIG_INVALID, "Migration concurrency must be a positive integer.")
                    .with_context("env", MIGRATION_CONCURRENCY_ENV)
                    .with_context("value", raw.clone())
            })?;
            self.migration_concurrency = limit.max(1);
        }
        Ok(())
    }

    fn set_data_dir(&mut self, dir: PathBuf) {
        let old = std::mem::replace(&mut self.data_dir, dir);
        if self.db_path == old.join("data.sqlite") {
            self.db_path = self.data_dir.join("data.sqlite");
        }
        if self.legacy_db_path == old.join("data.json") {
            self.legacy_db_path = self.data_dir.join("data.json");
        }
    }

    fn absolute(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.app_root.join(path)
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join(LEGACY_MARKER_FILE)
    }
}
