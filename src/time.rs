use chrono::{NaiveDateTime, Utc};

/// Storage format for every `*_at` text column.
pub const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current UTC time rendered in the storage format.
pub fn now_sql() -> String {
    Utc::now().format(SQL_DATETIME_FORMAT).to_string()
}

pub fn parse_sql(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, SQL_DATETIME_FORMAT).ok()
}
