use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{LEGACY_STORE_PARSE, LEGACY_STORE_SHAPE};
use crate::{AppError, AppResult};

pub const THREADS_KEY: &str = "threads";
pub const BLOCKED_KEY: &str = "blocked";
pub const SNIPPETS_KEY: &str = "snippets";

/// Read-only key/value view over the legacy JSON document.
pub trait LegacyStore: Send + Sync {
    /// Value stored under `key`, or `default` when the key is absent or null.
    fn get(&self, key: &str, default: Value) -> AppResult<Value>;
}

/// Thread that was still open when the legacy bot was retired.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyThread {
    #[serde(deserialize_with = "id_string")]
    pub channel_id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySnippet {
    #[serde(default, deserialize_with = "nullable_string")]
    pub text: String,
    #[serde(default, deserialize_with = "truthy")]
    pub is_anonymous: bool,
}

/// Legacy ids were written as either JSON strings or numbers.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_id(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
}

pub(crate) fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(is_truthy(&Value::deserialize(deserializer)?))
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn shape_error(key: &str, err: serde_json::Error) -> AppError {
    AppError::new(LEGACY_STORE_SHAPE, "Legacy document has an unexpected shape.")
        .with_context("key", key)
        .with_cause(AppError::from(err))
}

pub fn legacy_threads(store: &dyn LegacyStore) -> AppResult<Vec<LegacyThread>> {
    let raw = store.get(THREADS_KEY, Value::Array(Vec::new()))?;
    serde_json::from_value(raw).map_err(|err| shape_error(THREADS_KEY, err))
}

pub fn legacy_blocked(store: &dyn LegacyStore) -> AppResult<Vec<String>> {
    let raw = store.get(BLOCKED_KEY, Value::Array(Vec::new()))?;
    let items: Vec<Value> =
        serde_json::from_value(raw).map_err(|err| shape_error(BLOCKED_KEY, err))?;
    items
        .iter()
        .map(|item| {
            value_to_id(item).ok_or_else(|| {
                AppError::new(LEGACY_STORE_SHAPE, "Blocked user id is not a string or number.")
                    .with_context("key", BLOCKED_KEY)
                    .with_context("value", item.to_string())
            })
        })
        .collect()
}

/// Trigger/snippet pairs in document order.
pub fn legacy_snippets(store: &dyn LegacyStore) -> AppResult<Vec<(String, LegacySnippet)>> {
    let raw = store.get(SNIPPETS_KEY, Value::Object(Map::new()))?;
    let map: Map<String, Value> =
        serde_json::from_value(raw).map_err(|err| shape_error(SNIPPETS_KEY, err))?;
    map.into_iter()
        .map(|(trigger, data)| {
            let snippet: LegacySnippet = serde_json::from_value(data).map_err(|err| {
                shape_error(SNIPPETS_KEY, err).with_context("trigger", trigger.clone())
            })?;
            Ok((trigger, snippet))
        })
        .collect()
}

/// Legacy store backed by a single JSON object document on disk.
///
/// The document is read once by [`JsonDocStore::open`]; the legacy bot is
/// retired, so nothing writes it while the migration runs.
pub struct JsonDocStore {
    doc: Map<String, Value>,
}

impl JsonDocStore {
    /// A missing or blank file opens as an empty document.
    pub async fn open(path: &Path) -> AppResult<Self> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "legacy_store_read")
                    .with_context("path", path.display().to_string()))
            }
        };
        let doc = Self::parse(&data)
            .map_err(|err| err.with_context("path", path.display().to_string()))?;
        info!(
            target: "modmail",
            event = "legacy_store_opened",
            path = %path.display(),
            keys = doc.len()
        );
        Ok(Self { doc })
    }

    fn parse(data: &str) -> AppResult<Map<String, Value>> {
        if data.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(AppError::new(
                LEGACY_STORE_PARSE,
                "Legacy document root is not a JSON object.",
            )),
            Err(err) => Err(
                AppError::new(LEGACY_STORE_PARSE, "Legacy document is not valid JSON.")
                    .with_cause(AppError::from(err)),
            ),
        }
    }
}

impl LegacyStore for JsonDocStore {
    fn get(&self, key: &str, default: Value) -> AppResult<Value> {
        Ok(lookup(&self.doc, key, default))
    }
}

fn lookup(doc: &Map<String, Value>, key: &str, default: Value) -> Value {
    match doc.get(key) {
        Some(Value::Null) | None => default,
        Some(value) => value.clone(),
    }
}

#[derive(Default)]
pub struct MemoryLegacyStore {
    data: Mutex<Map<String, Value>>,
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        self.lock().insert(key.to_string(), value);
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LegacyStore for MemoryLegacyStore {
    fn get(&self, key: &str, default: Value) -> AppResult<Value> {
        Ok(lookup(&self.lock(), key, default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_document_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = JsonDocStore::open(&dir.path().join("data.json")).await.unwrap();
        assert!(legacy_threads(&store).unwrap().is_empty());
        assert!(legacy_blocked(&store).unwrap().is_empty());
        assert!(legacy_snippets(&store).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonDocStore::open(&path).await.err().expect("parse error");
        assert_eq!(err.code(), "LEGACY/STORE_PARSE");
        assert_eq!(err.cause().map(|c| c.code()), Some("JSON/SYNTAX"));
        assert_eq!(
            err.context().get("path").map(String::as_str),
            Some(path.display().to_string().as_str())
        );

        std::fs::write(&path, "[1, 2]").unwrap();
        let err = JsonDocStore::open(&path).await.err().expect("root error");
        assert_eq!(err.code(), "LEGACY/STORE_PARSE");
    }

    #[tokio::test]
    async fn reads_typed_records_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            json!({
                "threads": [{"channelId": 123, "userId": "u1", "username": "Bob"}],
                "blocked": ["u2", 42],
                "snippets": {
                    "!hi": {"text": "Hello!", "isAnonymous": true},
                    "!bye": {"text": "Bye", "isAnonymous": 0}
                }
            })
            .to_string(),
        )
        .unwrap();
        let store = JsonDocStore::open(&path).await.unwrap();

        let threads = legacy_threads(&store).unwrap();
        assert_eq!(
            threads,
            vec![LegacyThread {
                channel_id: "123".into(),
                user_id: "u1".into(),
                username: "Bob".into(),
            }]
        );
        assert_eq!(legacy_blocked(&store).unwrap(), vec!["u2", "42"]);

        let snippets = legacy_snippets(&store).unwrap();
        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].0, "!hi");
        assert!(snippets[0].1.is_anonymous);
        assert_eq!(snippets[1].0, "!bye");
        assert!(!snippets[1].1.is_anonymous);
    }

    #[test]
    fn null_value_falls_back_to_default() {
        let store = MemoryLegacyStore::from_value(json!({ "blocked": null }));
        assert_eq!(store.get(BLOCKED_KEY, json!([])).unwrap(), json!([]));
    }

    #[test]
    fn snippet_truthiness_follows_legacy_rules() {
        for (raw, expected) in [
            (json!(true), true),
            (json!(1), true),
            (json!("yes"), true),
            (json!(false), false),
            (json!(0), false),
            (json!(""), false),
            (json!(null), false),
        ] {
            assert_eq!(is_truthy(&raw), expected, "{raw}");
        }

        let store = MemoryLegacyStore::from_value(json!({
            "snippets": { "!x": {}, "!y": { "text": null, "isAnonymous": null } }
        }));
        let snippets = legacy_snippets(&store).unwrap();
        for (_, snippet) in &snippets {
            assert_eq!(snippet.text, "");
            assert!(!snippet.is_anonymous);
        }
    }

    #[test]
    fn set_survives_a_poisoned_lock() {
        let store = std::sync::Arc::new(MemoryLegacyStore::new());
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.data.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(store.data.is_poisoned());

        store.set(BLOCKED_KEY, json!(["u2"]));
        assert_eq!(legacy_blocked(store.as_ref()).unwrap(), vec!["u2"]);
    }

    #[test]
    fn malformed_blocked_entry_is_reported() {
        let store = MemoryLegacyStore::new();
        store.set(BLOCKED_KEY, json!([{"id": 1}]));
        let err = legacy_blocked(&store).unwrap_err();
        assert_eq!(err.code(), "LEGACY/STORE_SHAPE");
    }
}
