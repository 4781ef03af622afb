use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite, Transaction};
use std::future::Future;
use std::path::Path;

use crate::{AppError, AppResult};

pub async fn open_sqlite_pool(db_path: &Path, max_connections: u32) -> AppResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target: "modmail",
                error = %e,
                event = "db_dir_create_failed",
                path = %parent.display()
            );
            AppError::from(e)
                .with_context("operation", "db_dir_create")
                .with_context("path", parent.display().to_string())
        })?;
    }
    tracing::info!(target: "modmail", event = "db_path", path = %db_path.display());

    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .log_statements(log::LevelFilter::Off);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "db_open")
                .with_context("path", db_path.display().to_string())
        })?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "modmail",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = %fks.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "modmail",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Run work inside a transaction. Commits on success, rolls back on error.
pub async fn run_in_tx<R, E, F>(pool: &Pool<Sqlite>, f: F) -> Result<R, E>
where
    E: From<sqlx::Error>,
    F: for<'t> FnOnce(
        &'t mut Transaction<'static, Sqlite>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<R, E>> + Send + 't>>,
{
    use tracing::{debug, error, warn};

    let mut tx = pool.begin().await.map_err(E::from)?;
    debug!(target: "modmail", event = "db_tx_begin");
    match f(&mut tx).await {
        Ok(val) => {
            tx.commit().await.map_err(E::from)?;
            debug!(target: "modmail", event = "db_tx_commit");
            Ok(val)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target: "modmail", event = "db_tx_rollback_failed", error = %rb);
            } else {
                warn!(target: "modmail", event = "db_tx_rollback");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_parent_and_enables_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.sqlite");
        let pool = open_sqlite_pool(&path, 2).await.expect("open pool");
        assert!(path.exists());

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));
        pool.close().await;
    }

    #[tokio::test]
    async fn run_in_tx_commits_and_rolls_back() {
        let dir = tempdir().unwrap();
        let pool = open_sqlite_pool(&dir.path().join("tx.sqlite"), 1)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (val TEXT UNIQUE);")
            .execute(&pool)
            .await
            .unwrap();

        run_in_tx(&pool, |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO t (val) VALUES ('ok');")
                    .execute(&mut **tx)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await
        .unwrap();

        let res = run_in_tx(&pool, |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO t (val) VALUES ('dup');")
                    .execute(&mut **tx)
                    .await?;
                sqlx::query("INSERT INTO t (val) VALUES ('dup');")
                    .execute(&mut **tx)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .await;
        assert!(res.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t;")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
