use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Legacy JSON document is not valid JSON or not a JSON object.
pub const LEGACY_STORE_PARSE: &str = "LEGACY/STORE_PARSE";
/// A legacy key holds a value of the wrong shape.
pub const LEGACY_STORE_SHAPE: &str = "LEGACY/STORE_SHAPE";
/// The completion marker could not be written.
pub const LEGACY_MARKER_WRITE: &str = "LEGACY/MARKER_WRITE";
pub const CONFIG_PARSE: &str = "CONFIG/PARSE";
pub const CONFIG_INVALID: &str = "CONFIG/INVALID";
/// Foreign error with no more specific mapping.
pub const UNKNOWN: &str = "APP/UNKNOWN";

/// Error carried through the migration and into structured log records.
///
/// `context` names the failing operation and the legacy record it was
/// working on (`file`, `channel_id`, `user_id`, `trigger`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Later values replace earlier ones under the same key.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let pairs: Vec<String> = self
                .context
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            write!(f, " ({})", pairs.join(", "))?;
        }
        Ok(())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Schema application reports through `anyhow`; an `AppError` inside the
/// chain is kept as is, anything else nests as `APP/UNKNOWN`.
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        fn walk(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            let mut node = AppError::new(UNKNOWN, err.to_string());
            node.cause = err.source().map(|source| Box::new(walk(source)));
            node
        }
        walk(error.as_ref())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        let app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
        match error.raw_os_error() {
            Some(os_code) => app_error.with_context("os_code", os_code.to_string()),
            None => app_error,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        use serde_json::error::Category;

        let code = match error.classify() {
            Category::Io => "JSON/IO",
            Category::Syntax => "JSON/SYNTAX",
            Category::Data => "JSON/DATA",
            Category::Eof => "JSON/EOF",
        };
        let app_error = AppError::new(code, error.to_string());
        if error.line() == 0 {
            return app_error;
        }
        app_error
            .with_context("line", error.line().to_string())
            .with_context("column", error.column().to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                let app_error = AppError::new(code, db.message());
                match db.constraint() {
                    Some(constraint) => app_error.with_context("constraint", constraint),
                    None => app_error,
                }
            }
            sqlx::Error::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            sqlx::Error::PoolTimedOut => {
                AppError::new("SQLX/POOL_TIMEOUT", "Timed out waiting for a database connection")
            }
            sqlx::Error::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            sqlx::Error::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            sqlx::Error::ColumnDecode { index, source } => {
                AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                    .with_context("column", index.to_string())
            }
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}
