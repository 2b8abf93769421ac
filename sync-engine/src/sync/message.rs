use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::storage::now_millis;
use crate::todo::{decode_record, Todo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    #[serde(rename = "todo")]
    Todo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
    SyncRequest,
}

/// The cross-tab wire message. `timestamp` is the sender's epoch-ms clock;
/// zero means "not stamped yet".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub resource: Resource,
    pub action: SyncAction,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
    pub source: String,
}

impl SyncMessage {
    pub fn new(action: SyncAction, data: Value, source: impl Into<String>) -> Self {
        Self {
            resource: Resource::Todo,
            action,
            data,
            timestamp: now_millis(),
            source: source.into(),
        }
    }

    pub fn for_todo(action: SyncAction, todo: &Todo, source: impl Into<String>) -> Result<Self> {
        Ok(Self::new(action, serde_json::to_value(todo)?, source))
    }

    pub fn deleted(id: &str, source: impl Into<String>) -> Self {
        Self::new(SyncAction::Deleted, json!({ "id": id }), source)
    }

    pub fn sync_request(source: impl Into<String>) -> Self {
        Self::new(SyncAction::SyncRequest, Value::Null, source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            return Err(Error::Validation("sync message source must not be empty".into()));
        }
        Ok(())
    }

    /// Checks an untrusted value against the wire shape. Extra fields are
    /// ignored.
    pub fn from_value(value: Value) -> Result<Self> {
        let message: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed sync message: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("malformed sync message: {}", e)))?;
        Self::from_value(value)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The payload as a full todo record.
    pub fn todo(&self) -> Result<Todo> {
        decode_record(&self.data).map(|r| r.into_todo())
    }

    pub fn todo_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}
