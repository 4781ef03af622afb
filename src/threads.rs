use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

use crate::time::now_sql;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum ThreadStatus {
    Open = 1,
    Closed = 2,
    Suspended = 3,
}

impl ThreadStatus {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ThreadStatus::Open),
            2 => Some(ThreadStatus::Closed),
            3 => Some(ThreadStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum ThreadMessageType {
    System = 1,
    Chat = 2,
    FromUser = 3,
    ToUser = 4,
    /// Body holds an entire imported transcript.
    Legacy = 5,
    Command = 6,
}

impl ThreadMessageType {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ThreadMessageType::System),
            2 => Some(ThreadMessageType::Chat),
            3 => Some(ThreadMessageType::FromUser),
            4 => Some(ThreadMessageType::ToUser),
            5 => Some(ThreadMessageType::Legacy),
            6 => Some(ThreadMessageType::Command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub status: i64,
    pub is_legacy: bool,
    pub user_id: String,
    pub user_name: String,
    pub channel_id: Option<String>,
    pub created_at: String,
}

impl Thread {
    pub fn status(&self) -> Option<ThreadStatus> {
        ThreadStatus::from_i64(self.status)
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Thread {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            is_legacy: row.try_get("is_legacy")?,
            user_id: row.try_get("user_id")?,
            user_name: row.try_get("user_name")?,
            channel_id: row.try_get("channel_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub thread_id: String,
    pub message_type: i64,
    pub user_id: Option<String>,
    pub user_name: String,
    pub body: String,
    pub is_anonymous: bool,
    pub created_at: String,
}

impl ThreadMessage {
    pub fn message_type(&self) -> Option<ThreadMessageType> {
        ThreadMessageType::from_i64(self.message_type)
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ThreadMessage {
            id: row.try_get("id")?,
            thread_id: row.try_get("thread_id")?,
            message_type: row.try_get("message_type")?,
            user_id: row.try_get("user_id")?,
            user_name: row.try_get("user_name")?,
            body: row.try_get("body")?,
            is_anonymous: row.try_get("is_anonymous")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewThread {
    /// `None` lets [`create_thread`] assign a fresh UUID.
    pub id: Option<String>,
    pub status: ThreadStatus,
    pub is_legacy: bool,
    pub user_id: String,
    pub user_name: String,
    pub channel_id: Option<String>,
    /// `None` stamps the current UTC time.
    pub created_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewThreadMessage {
    pub thread_id: String,
    pub message_type: ThreadMessageType,
    pub user_id: Option<String>,
    pub user_name: String,
    pub body: String,
    pub created_at: String,
}

/// Insert a thread, returning its id, or `None` when a uniqueness constraint
/// (id, or channel among open threads) already holds a row.
pub async fn create_thread<'e, E>(executor: E, thread: NewThread) -> AppResult<Option<String>>
where
    E: SqliteExecutor<'e>,
{
    let id = thread
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let created_at = thread.created_at.unwrap_or_else(now_sql);

    let res = sqlx::query(
        "INSERT INTO threads (id, status, is_legacy, user_id, user_name, channel_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(&id)
    .bind(thread.status.as_i64())
    .bind(thread.is_legacy)
    .bind(&thread.user_id)
    .bind(&thread.user_name)
    .bind(&thread.channel_id)
    .bind(&created_at)
    .execute(executor)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "thread_create")
            .with_context("thread_id", id.clone())
    })?;

    Ok((res.rows_affected() > 0).then_some(id))
}

pub async fn add_message<'e, E>(executor: E, message: NewThreadMessage) -> AppResult<i64>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "INSERT INTO thread_messages (thread_id, message_type, user_id, user_name, body, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.thread_id)
    .bind(message.message_type.as_i64())
    .bind(&message.user_id)
    .bind(&message.user_name)
    .bind(&message.body)
    .bind(&message.created_at)
    .execute(executor)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "thread_message_create")
            .with_context("thread_id", message.thread_id.clone())
    })?;
    Ok(res.last_insert_rowid())
}

pub async fn find_by_id<'e, E>(executor: E, id: &str) -> AppResult<Option<Thread>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "SELECT id, status, is_legacy, user_id, user_name, channel_id, created_at
           FROM threads WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .and_then(|row| row.as_ref().map(Thread::from_row).transpose())
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "thread_find_by_id")
            .with_context("thread_id", id.to_string())
    })
}

/// Any thread, open or closed, bound to `channel_id`.
pub async fn find_by_channel_id<'e, E>(executor: E, channel_id: &str) -> AppResult<Option<Thread>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "SELECT id, status, is_legacy, user_id, user_name, channel_id, created_at
           FROM threads WHERE channel_id = ? LIMIT 1",
    )
    .bind(channel_id)
    .fetch_optional(executor)
    .await
    .and_then(|row| row.as_ref().map(Thread::from_row).transpose())
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "thread_find_by_channel")
            .with_context("channel_id", channel_id.to_string())
    })
}

pub async fn messages_for<'e, E>(executor: E, thread_id: &str) -> AppResult<Vec<ThreadMessage>>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "SELECT id, thread_id, message_type, user_id, user_name, body, is_anonymous, created_at
           FROM thread_messages WHERE thread_id = ? ORDER BY id",
    )
    .bind(thread_id)
    .fetch_all(executor)
    .await
    .and_then(|rows| rows.iter().map(ThreadMessage::from_row).collect())
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "thread_messages_list")
            .with_context("thread_id", thread_id.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply_migrations(&pool).await.unwrap();
        pool
    }

    fn open_thread(channel: &str) -> NewThread {
        NewThread {
            id: None,
            status: ThreadStatus::Open,
            is_legacy: false,
            user_id: "u1".into(),
            user_name: "Bob".into(),
            channel_id: Some(channel.into()),
            created_at: None,
        }
    }

    #[test]
    fn enum_codes_round_trip() {
        assert_eq!(ThreadStatus::from_i64(ThreadStatus::Closed.as_i64()), Some(ThreadStatus::Closed));
        assert_eq!(ThreadMessageType::Legacy.as_i64(), 5);
        assert_eq!(ThreadMessageType::from_i64(0), None);
    }

    #[tokio::test]
    async fn create_assigns_uuid_and_timestamp() {
        let pool = pool().await;
        let id = create_thread(&pool, open_thread("c1"))
            .await
            .unwrap()
            .expect("inserted");
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let thread = find_by_channel_id(&pool, "c1").await.unwrap().expect("found");
        assert_eq!(thread.id, id);
        assert_eq!(thread.status(), Some(ThreadStatus::Open));
        assert!(crate::time::parse_sql(&thread.created_at).is_some());
    }

    #[tokio::test]
    async fn second_open_thread_on_same_channel_is_ignored() {
        let pool = pool().await;
        assert!(create_thread(&pool, open_thread("c1")).await.unwrap().is_some());
        assert!(create_thread(&pool, open_thread("c1")).await.unwrap().is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn closed_threads_may_share_a_null_channel() {
        let pool = pool().await;
        for id in ["t1", "t2"] {
            let inserted = create_thread(
                &pool,
                NewThread {
                    id: Some(id.into()),
                    status: ThreadStatus::Closed,
                    is_legacy: true,
                    user_id: "u".into(),
                    user_name: String::new(),
                    channel_id: None,
                    created_at: Some("2020-01-01 00:00:00".into()),
                },
            )
            .await
            .unwrap();
            assert_eq!(inserted.as_deref(), Some(id));
        }
        assert!(find_by_id(&pool, "t2").await.unwrap().is_some());
        assert!(find_by_id(&pool, "missing").await.unwrap().is_none());
    }
}
