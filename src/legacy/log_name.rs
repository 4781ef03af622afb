//! Parser for legacy transcript file names.
//!
//! Closed threads were archived as `<timestamp>__<userId>__<threadId>.txt`,
//! where the timestamp is `YYYY-MM-DD` followed by a separator and the time
//! of day with `-` standing in for `:` (colons are not portable in file
//! names), e.g. `2021-05-01T10-15-30__42__abc.txt`.

use thiserror::Error;

use crate::time::{parse_sql, SQL_DATETIME_FORMAT};

pub const LOG_SUFFIX: &str = ".txt";
const SEGMENT_DELIMITER: &str = "__";
const DATE_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileName {
    /// Canonical `YYYY-MM-DD HH:MM:SS`.
    pub created_at: String,
    pub user_id: String,
    pub thread_id: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogNameError {
    #[error("file name does not end in .txt")]
    MissingSuffix,
    #[error("expected 3 `__`-separated segments, found {found}")]
    SegmentCount { found: usize },
    #[error("segment `{0}` is empty")]
    EmptySegment(&'static str),
    #[error("timestamp `{raw}` does not describe a date and time")]
    Timestamp { raw: String },
}

impl LogNameError {
    /// Stable label used in logs and skip counters.
    pub fn reason(&self) -> &'static str {
        match self {
            LogNameError::MissingSuffix => "missing_suffix",
            LogNameError::SegmentCount { .. } => "segment_count",
            LogNameError::EmptySegment(_) => "empty_segment",
            LogNameError::Timestamp { .. } => "timestamp",
        }
    }
}

pub fn is_log_file(name: &str) -> bool {
    name.ends_with(LOG_SUFFIX)
}

/// Turn the filesystem-safe timestamp into `YYYY-MM-DD HH:MM:SS`.
///
/// The first ten characters are the date; everything from the twelfth
/// character on is the time with its dashes restored to colons. A time
/// without seconds gets `:00`.
pub fn normalize_timestamp(raw: &str) -> Result<String, LogNameError> {
    let invalid = || LogNameError::Timestamp {
        raw: raw.to_string(),
    };

    let date = raw.get(..DATE_LEN).ok_or_else(invalid)?;
    let time = raw.get(DATE_LEN + 1..).ok_or_else(invalid)?;
    let candidate = format!("{date} {}", time.replace('-', ":"));

    let parsed = parse_sql(&candidate)
        .or_else(|| parse_sql(&format!("{candidate}:00")))
        .ok_or_else(invalid)?;
    Ok(parsed.format(SQL_DATETIME_FORMAT).to_string())
}

pub fn parse_log_file_name(name: &str) -> Result<LogFileName, LogNameError> {
    let stem = name
        .strip_suffix(LOG_SUFFIX)
        .ok_or(LogNameError::MissingSuffix)?;

    let segments: Vec<&str> = stem.split(SEGMENT_DELIMITER).collect();
    let [raw_date, user_id, thread_id] = segments.as_slice() else {
        return Err(LogNameError::SegmentCount {
            found: segments.len(),
        });
    };

    for (label, value) in [
        ("timestamp", raw_date),
        ("user_id", user_id),
        ("thread_id", thread_id),
    ] {
        if value.is_empty() {
            return Err(LogNameError::EmptySegment(label));
        }
    }

    Ok(LogFileName {
        created_at: normalize_timestamp(raw_date)?,
        user_id: user_id.to_string(),
        thread_id: thread_id.to_string(),
    })
}
