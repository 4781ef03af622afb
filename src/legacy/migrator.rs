use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::{Config, LEGACY_MARKER_FILE};
use crate::db::run_in_tx;
use crate::legacy::log_name::{is_log_file, parse_log_file_name};
use crate::legacy::store::{
    legacy_blocked, legacy_snippets, legacy_threads, LegacySnippet, LegacyStore, LegacyThread,
    BLOCKED_KEY, SNIPPETS_KEY, THREADS_KEY,
};
use crate::threads::{self, NewThread, NewThreadMessage, ThreadMessageType, ThreadStatus};
use crate::time::now_sql;
use crate::error::LEGACY_MARKER_WRITE;
use crate::{AppError, AppResult};

pub const SKIP_REASON_EXISTS: &str = "exists";
pub const SKIP_REASON_CONFLICT: &str = "conflict";
pub const SKIP_REASON_MALFORMED_NAME: &str = "malformed_name";

/// Blocks recorded by the legacy bot are attributed to the system user.
pub const SYSTEM_USER_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationCategory {
    OpenThreads,
    Logs,
    BlockedUsers,
    Snippets,
}

impl MigrationCategory {
    /// Fixed run order.
    pub const ALL: [MigrationCategory; 4] = [
        MigrationCategory::OpenThreads,
        MigrationCategory::Logs,
        MigrationCategory::BlockedUsers,
        MigrationCategory::Snippets,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            MigrationCategory::OpenThreads => "open_threads",
            MigrationCategory::Logs => "logs",
            MigrationCategory::BlockedUsers => "blocked_users",
            MigrationCategory::Snippets => "snippets",
        }
    }

    const fn operation(self) -> &'static str {
        match self {
            MigrationCategory::OpenThreads => "legacy_migrate_open_threads",
            MigrationCategory::Logs => "legacy_migrate_logs",
            MigrationCategory::BlockedUsers => "legacy_migrate_blocked_users",
            MigrationCategory::Snippets => "legacy_migrate_snippets",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Skipped(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: MigrationCategory,
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub skipped_reasons: BTreeMap<String, u64>,
    pub duration_ms: u64,
}

impl CategoryReport {
    fn new(category: MigrationCategory) -> Self {
        Self {
            category,
            processed: 0,
            inserted: 0,
            skipped: 0,
            skipped_reasons: BTreeMap::new(),
            duration_ms: 0,
        }
    }

    fn record(&mut self, outcome: RecordOutcome) {
        self.processed += 1;
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::Skipped(reason) => {
                self.skipped += 1;
                *self.skipped_reasons.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
    }

    pub fn skipped_for(&self, reason: &str) -> u64 {
        self.skipped_reasons.get(reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub categories: Vec<CategoryReport>,
    pub marker_path: PathBuf,
}

impl MigrationSummary {
    pub fn category(&self, category: MigrationCategory) -> Option<&CategoryReport> {
        self.categories.iter().find(|r| r.category == category)
    }
}

/// Moves legacy JSON/transcript data into the relational store.
pub struct LegacyMigrator {
    pool: SqlitePool,
    store: Arc<dyn LegacyStore>,
    config: Config,
}

impl LegacyMigrator {
    pub fn new(pool: SqlitePool, store: Arc<dyn LegacyStore>, config: Config) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn marker_path(&self) -> PathBuf {
        self.config.marker_path()
    }

    /// Whether a migration still has to run. Never writes anything.
    pub async fn should_migrate(&self) -> AppResult<bool> {
        should_migrate(self.store.as_ref(), &self.config).await
    }

    /// Run every category in order, then write the completion marker.
    ///
    /// A failed category stops the run before the marker is written, so the
    /// whole pass is retried on the next start.
    pub async fn migrate(&self) -> AppResult<MigrationSummary> {
        let mut categories = Vec::with_capacity(MigrationCategory::ALL.len());
        for category in MigrationCategory::ALL {
            let result = match category {
                MigrationCategory::OpenThreads => self.migrate_open_threads().await,
                MigrationCategory::Logs => self.migrate_logs().await,
                MigrationCategory::BlockedUsers => self.migrate_blocked_users().await,
                MigrationCategory::Snippets => self.migrate_snippets().await,
            };
            match result {
                Ok(report) => categories.push(report),
                Err(err) => {
                    error!(
                        target: "modmail",
                        event = "legacy_migration_category_failed",
                        category = category.as_str(),
                        code = err.code(),
                        error = %err
                    );
                    return Err(err.with_context("category", category.as_str()));
                }
            }
        }

        let marker_path = self.write_marker().await?;
        Ok(MigrationSummary {
            categories,
            marker_path,
        })
    }

    pub async fn migrate_open_threads(&self) -> AppResult<CategoryReport> {
        let legacy = legacy_threads(self.store.as_ref())?;
        self.run_category(MigrationCategory::OpenThreads, legacy, |thread| {
            self.migrate_open_thread(thread)
        })
        .await
    }

    async fn migrate_open_thread(&self, legacy: LegacyThread) -> AppResult<RecordOutcome> {
        let op = MigrationCategory::OpenThreads.operation();
        let channel_id = legacy.channel_id.clone();
        let with_record = |err: AppError| {
            err.with_context("operation", op)
                .with_context("channel_id", channel_id.clone())
        };

        if threads::find_by_channel_id(&self.pool, &legacy.channel_id)
            .await
            .map_err(with_record)?
            .is_some()
        {
            return Ok(RecordOutcome::Skipped(SKIP_REASON_EXISTS));
        }

        let created = threads::create_thread(
            &self.pool,
            NewThread {
                id: None,
                status: ThreadStatus::Open,
                is_legacy: true,
                user_id: legacy.user_id,
                user_name: legacy.username,
                channel_id: Some(legacy.channel_id),
                created_at: None,
            },
        )
        .await
        .map_err(with_record)?;

        Ok(match created {
            Some(_) => RecordOutcome::Inserted,
            None => RecordOutcome::Skipped(SKIP_REASON_CONFLICT),
        })
    }

    pub async fn migrate_logs(&self) -> AppResult<CategoryReport> {
        let names = self.list_log_files().await?;
        self.run_category(MigrationCategory::Logs, names, |name| self.migrate_log_file(name))
            .await
    }

    async fn list_log_files(&self) -> AppResult<Vec<String>> {
        let log_dir = &self.config.log_dir;
        let op = MigrationCategory::Logs.operation();
        let mut entries = match tokio::fs::read_dir(log_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    target: "modmail",
                    event = "legacy_log_dir_missing",
                    path = %log_dir.display()
                );
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", op)
                    .with_context("path", log_dir.display().to_string()))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", op)
                .with_context("path", log_dir.display().to_string())
        })? {
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if is_dir {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if is_log_file(&name) => names.push(name),
                Ok(_) => {}
                Err(raw) => warn!(
                    target: "modmail",
                    event = "legacy_log_malformed_name",
                    file = %raw.to_string_lossy(),
                    reason = "not_utf8"
                ),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn migrate_log_file(&self, name: String) -> AppResult<RecordOutcome> {
        let parsed = match parse_log_file_name(&name) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    target: "modmail",
                    event = "legacy_log_malformed_name",
                    file = %name,
                    reason = err.reason(),
                    error = %err
                );
                return Ok(RecordOutcome::Skipped(SKIP_REASON_MALFORMED_NAME));
            }
        };

        let op = MigrationCategory::Logs.operation();
        let with_record = |err: AppError| {
            err.with_context("operation", op)
                .with_context("file", name.clone())
        };

        if threads::find_by_id(&self.pool, &parsed.thread_id)
            .await
            .map_err(with_record)?
            .is_some()
        {
            return Ok(RecordOutcome::Skipped(SKIP_REASON_EXISTS));
        }

        let path = self.config.log_dir.join(&name);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|err| with_record(AppError::from(err)))?;
        let body = String::from_utf8_lossy(&raw).into_owned();

        let thread = NewThread {
            id: Some(parsed.thread_id.clone()),
            status: ThreadStatus::Closed,
            is_legacy: true,
            user_id: parsed.user_id.clone(),
            user_name: String::new(),
            channel_id: None,
            created_at: Some(parsed.created_at.clone()),
        };
        let message = NewThreadMessage {
            thread_id: parsed.thread_id,
            message_type: ThreadMessageType::Legacy,
            user_id: Some(parsed.user_id),
            user_name: String::new(),
            body,
            created_at: parsed.created_at,
        };

        // The thread insert is the first write, so a concurrent copy of this
        // file turns into a no-op instead of a second message.
        let inserted = run_in_tx(&self.pool, move |tx| {
            Box::pin(async move {
                if threads::create_thread(&mut **tx, thread).await?.is_none() {
                    return Ok(false);
                }
                threads::add_message(&mut **tx, message).await?;
                Ok::<_, AppError>(true)
            })
        })
        .await
        .map_err(with_record)?;

        Ok(if inserted {
            RecordOutcome::Inserted
        } else {
            RecordOutcome::Skipped(SKIP_REASON_CONFLICT)
        })
    }

    pub async fn migrate_blocked_users(&self) -> AppResult<CategoryReport> {
        let blocked_at = now_sql();
        let user_ids = legacy_blocked(self.store.as_ref())?;
        self.run_category(MigrationCategory::BlockedUsers, user_ids, |user_id| {
            self.migrate_blocked_user(user_id, &blocked_at)
        })
        .await
    }

    async fn migrate_blocked_user(&self, user_id: String, blocked_at: &str) -> AppResult<RecordOutcome> {
        let op = MigrationCategory::BlockedUsers.operation();
        let with_record = |err: sqlx::Error| {
            AppError::from(err)
                .with_context("operation", op)
                .with_context("user_id", user_id.clone())
        };

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM blocked_users WHERE user_id = ?")
                .bind(&user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(with_record)?;
        if existing.is_some() {
            return Ok(RecordOutcome::Skipped(SKIP_REASON_EXISTS));
        }

        let res = sqlx::query(
            "INSERT INTO blocked_users (user_id, user_name, blocked_by, blocked_at)
             VALUES (?, '', ?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(&user_id)
        .bind(SYSTEM_USER_ID)
        .bind(blocked_at)
        .execute(&self.pool)
        .await
        .map_err(with_record)?;

        Ok(inserted_or_conflict(res.rows_affected()))
    }

    pub async fn migrate_snippets(&self) -> AppResult<CategoryReport> {
        let created_at = now_sql();
        let snippets = legacy_snippets(self.store.as_ref())?;
        self.run_category(MigrationCategory::Snippets, snippets, |(trigger, snippet)| {
            self.migrate_snippet(trigger, snippet, &created_at)
        })
        .await
    }

    async fn migrate_snippet(
        &self,
        trigger: String,
        snippet: LegacySnippet,
        created_at: &str,
    ) -> AppResult<RecordOutcome> {
        let op = MigrationCategory::Snippets.operation();
        let with_record = |err: sqlx::Error| {
            AppError::from(err)
                .with_context("operation", op)
                .with_context("trigger", trigger.clone())
        };

        let existing: Option<i64> = sqlx::query_scalar(r#"SELECT 1 FROM snippets WHERE "trigger" = ?"#)
            .bind(&trigger)
            .fetch_optional(&self.pool)
            .await
            .map_err(with_record)?;
        if existing.is_some() {
            return Ok(RecordOutcome::Skipped(SKIP_REASON_EXISTS));
        }

        let res = sqlx::query(
            r#"INSERT INTO snippets ("trigger", body, is_anonymous, created_by, created_at)
               VALUES (?, ?, ?, NULL, ?)
               ON CONFLICT("trigger") DO NOTHING"#,
        )
        .bind(&trigger)
        .bind(&snippet.text)
        .bind(snippet.is_anonymous)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(with_record)?;

        Ok(inserted_or_conflict(res.rows_affected()))
    }

    /// Fan `op` out over `items` with at most `migration_concurrency` records
    /// in flight. The first failure abandons the rest of the batch.
    async fn run_category<T, F, Fut>(
        &self,
        category: MigrationCategory,
        items: Vec<T>,
        op: F,
    ) -> AppResult<CategoryReport>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = AppResult<RecordOutcome>>,
    {
        let started = Instant::now();
        info!(
            target: "modmail",
            event = "legacy_migration_category_start",
            category = category.as_str(),
            records = items.len()
        );

        let outcomes: Vec<RecordOutcome> = stream::iter(items)
            .map(op)
            .buffer_unordered(self.config.migration_concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        let mut report = CategoryReport::new(category);
        for outcome in outcomes {
            report.record(outcome);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            target: "modmail",
            event = "legacy_migration_category_done",
            category = category.as_str(),
            processed = report.processed,
            inserted = report.inserted,
            skipped = report.skipped,
            duration_ms = report.duration_ms
        );
        Ok(report)
    }

    async fn write_marker(&self) -> AppResult<PathBuf> {
        let marker = self.marker_path();
        let tmp = self
            .config
            .data_dir
            .join(format!("{LEGACY_MARKER_FILE}.{}.tmp", uuid::Uuid::new_v4()));
        let with_marker = |err: std::io::Error, step: &str, path: &Path| {
            AppError::new(LEGACY_MARKER_WRITE, "Failed to record legacy migration completion.")
                .with_context("operation", step)
                .with_context("path", path.display().to_string())
                .with_cause(AppError::from(err))
        };

        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|err| with_marker(err, "legacy_marker_create_dir", &self.config.data_dir))?;
        let file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| with_marker(err, "legacy_marker_write_tmp", &tmp))?;
        let finished = async {
            file.sync_all()
                .await
                .map_err(|err| with_marker(err, "legacy_marker_sync_tmp", &tmp))?;
            drop(file);
            tokio::fs::rename(&tmp, &marker)
                .await
                .map_err(|err| with_marker(err, "legacy_marker_rename", &marker))?;
            Ok::<(), AppError>(())
        }
        .await;

        if let Err(err) = finished {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(
                    target: "modmail",
                    event = "legacy_marker_tmp_cleanup_failed",
                    path = %tmp.display(),
                    error = %cleanup
                );
            }
            return Err(err);
        }

        info!(
            target: "modmail",
            event = "legacy_migration_marker_written",
            path = %marker.display()
        );
        Ok(marker)
    }
}

/// Migration gate over the legacy inputs alone; needs no target database.
///
/// The marker wins; otherwise any non-empty legacy collection or an existing
/// log directory means there is work left.
pub async fn should_migrate(store: &dyn LegacyStore, config: &Config) -> AppResult<bool> {
    let reason = pending_reason(store, config).await?;
    info!(
        target: "modmail",
        event = "legacy_migration_gate",
        migrate = reason.is_some(),
        reason = reason.unwrap_or("none")
    );
    Ok(reason.is_some())
}

async fn pending_reason(
    store: &dyn LegacyStore,
    config: &Config,
) -> AppResult<Option<&'static str>> {
    if path_exists(&config.marker_path()).await {
        return Ok(None);
    }

    let checks = [
        (THREADS_KEY, json!([])),
        (BLOCKED_KEY, json!([])),
        (SNIPPETS_KEY, json!({})),
    ];
    for (key, default) in checks {
        if has_entries(&store.get(key, default)?) {
            return Ok(Some(key));
        }
    }

    if path_exists(&config.log_dir).await {
        return Ok(Some("log_dir"));
    }
    Ok(None)
}

fn inserted_or_conflict(rows_affected: u64) -> RecordOutcome {
    if rows_affected > 0 {
        RecordOutcome::Inserted
    } else {
        RecordOutcome::Skipped(SKIP_REASON_CONFLICT)
    }
}

fn has_entries(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
