use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::storage::{generate_id, now_millis};

pub const MAX_TITLE_CHARS: usize = 500;
pub const STORAGE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    /// A locally created todo with a freshly generated id.
    pub fn new(title: impl Into<String>) -> Self {
        let now = now_utc();
        Self {
            id: generate_id(),
            title: title.into(),
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_patch(&self, patch: &TodoPatch, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if let Some(title) = &patch.title {
            next.title = title.clone();
        }
        if let Some(completed) = patch.completed {
            next.completed = completed;
        }
        next.updated_at = at.max(self.created_at);
        next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl TodoPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), completed: None }
    }

    pub fn completed(completed: bool) -> Self {
        Self { title: None, completed: Some(completed) }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.completed.is_none()
    }
}

/// A todo as persisted by the durable stores. The underscore fields exist
/// only on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTodoRecord {
    #[serde(flatten)]
    pub todo: Todo,
    #[serde(rename = "_version", skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(rename = "_storedAt", skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<u64>,
}

impl StoredTodoRecord {
    pub fn stamp(todo: Todo) -> Self {
        Self {
            todo,
            version: Some(STORAGE_SCHEMA_VERSION),
            stored_at: Some(now_millis()),
        }
    }

    pub fn into_todo(self) -> Todo {
        self.todo
    }
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::Validation("Title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(Error::Validation(format!(
            "Title must be less than {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(())
}

pub fn validate_todo(todo: &Todo) -> Result<()> {
    if todo.id.is_empty() {
        return Err(Error::Validation("id must not be empty".into()));
    }
    validate_title(&todo.title)?;
    if todo.updated_at < todo.created_at {
        return Err(Error::Validation(format!(
            "updatedAt precedes createdAt for {}",
            todo.id
        )));
    }
    Ok(())
}

/// Decodes one stored record, accepting RFC 3339 strings or epoch-millisecond
/// numbers for the timestamps.
pub fn decode_record(value: &Value) -> Result<StoredTodoRecord> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Validation("record must be an object".into()))?;

    let id = string_field(obj, "id")?;
    let title = string_field(obj, "title")?;
    let completed = match obj.get("completed") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(Error::Validation("completed must be a boolean".into())),
    };
    let todo = Todo {
        id,
        title,
        completed,
        created_at: timestamp_field(obj, "createdAt")?,
        updated_at: timestamp_field(obj, "updatedAt")?,
    };
    validate_todo(&todo)?;

    Ok(StoredTodoRecord {
        todo,
        version: obj.get("_version").and_then(Value::as_u64).map(|v| v as u32),
        stored_at: obj.get("_storedAt").and_then(Value::as_u64),
    })
}

/// Decodes a stored array, keeping every valid record. Fails only when the
/// value is not an array or a non-empty array holds no valid record.
pub fn decode_records(value: &Value) -> Result<Vec<StoredTodoRecord>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::Validation("data must be an array".into()))?;

    let mut valid = Vec::with_capacity(items.len());
    let mut first_error = None;
    for item in items {
        match decode_record(item) {
            Ok(record) => valid.push(record),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) if valid.is_empty() => Err(e),
        Some(_) => {
            tracing::warn!(
                failed = items.len() - valid.len(),
                succeeded = valid.len(),
                "some stored todos failed validation"
            );
            Ok(valid)
        }
        None => Ok(valid),
    }
}

fn string_field(obj: &Map<String, Value>, name: &str) -> Result<String> {
    match obj.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(Error::Validation(format!("{} must be a string", name))),
    }
}

fn timestamp_field(obj: &Map<String, Value>, name: &str) -> Result<DateTime<Utc>> {
    match obj.get(name) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Validation(format!("{} is not a date: {}", name, e))),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| Error::Validation(format!("{} is out of range", name))),
        _ => Err(Error::Validation(format!("{} must be a date", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_normalizes_numeric_timestamps() {
        let record = decode_record(&json!({
            "id": "c1",
            "title": "Buy milk",
            "createdAt": 1_704_067_200_000i64,
            "updatedAt": "2024-01-01T00:00:05.000Z",
            "_version": 1,
        }))
        .unwrap();

        assert!(!record.todo.completed);
        assert_eq!(record.todo.created_at.timestamp_millis(), 1_704_067_200_000);
        assert_eq!(record.todo.updated_at.timestamp_millis(), 1_704_067_205_000);
        assert_eq!(record.version, Some(1));
    }

    #[test]
    fn test_rejects_bad_titles_and_dates() {
        let long = "x".repeat(MAX_TITLE_CHARS + 1);
        for bad in [
            json!({"id": "a", "title": "", "createdAt": 0, "updatedAt": 0}),
            json!({"id": "a", "title": long, "createdAt": 0, "updatedAt": 0}),
            json!({"id": "a", "title": "ok", "completed": "yes", "createdAt": 0, "updatedAt": 0}),
            json!({"id": "a", "title": "ok", "createdAt": "yesterday", "updatedAt": 0}),
            json!({"id": "a", "title": "ok", "createdAt": 10, "updatedAt": 5}),
            json!({"title": "ok", "createdAt": 0, "updatedAt": 0}),
        ] {
            assert!(matches!(decode_record(&bad), Err(Error::Validation(_))), "{}", bad);
        }
    }

    #[test]
    fn test_title_limit_counts_characters() {
        assert!(validate_title(&"é".repeat(MAX_TITLE_CHARS)).is_ok());
        assert!(validate_title("   ").is_err());
    }

    #[test]
    fn test_partial_array_keeps_valid_records() {
        let records = decode_records(&json!([
            {"id": "a", "title": "one", "createdAt": 0, "updatedAt": 0},
            {"id": "b", "title": 42},
        ]))
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].todo.id, "a");

        assert!(decode_records(&json!([{"id": "b"}])).is_err());
        assert!(decode_records(&json!({"id": "b"})).is_err());
        assert!(decode_records(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_stored_record_serializes_metadata_beside_fields() {
        let todo = Todo::new("Write tests");
        let value = serde_json::to_value(StoredTodoRecord::stamp(todo.clone())).unwrap();

        assert_eq!(value["title"], "Write tests");
        assert_eq!(value["_version"], STORAGE_SCHEMA_VERSION);
        assert!(value["_storedAt"].is_u64());

        let back = decode_record(&value).unwrap().into_todo();
        assert_eq!(back, todo);
    }

    #[test]
    fn test_patch_bumps_updated_at() {
        let todo = Todo::new("Draft");
        let later = todo.created_at + chrono::Duration::seconds(3);
        let patched = todo.with_patch(&TodoPatch::completed(true), later);

        assert!(patched.completed);
        assert_eq!(patched.title, "Draft");
        assert_eq!(patched.updated_at, later);
        assert_eq!(patched.created_at, todo.created_at);
    }
}
