use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{now_millis, KeyValueStore, TodoStore};
use crate::error::{Error, Result};
use crate::todo::{
    decode_records, now_utc, validate_todo, StoredTodoRecord, Todo, TodoPatch,
    STORAGE_SCHEMA_VERSION,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub primary: String,
    pub backup: String,
    pub metadata: String,
}

impl StorageKeys {
    pub fn new(base: &str) -> Self {
        Self {
            primary: base.to_string(),
            backup: format!("{}-backup", base),
            metadata: format!("{}-metadata", base),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetadata {
    pub last_sync: u64,
    pub version: u32,
    pub item_count: usize,
}

/// The fallback engine: the whole dataset as one JSON array in a key-value
/// slot, with a backup copy and a metadata record beside it.
pub struct LocalTodoStore {
    kv: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    // Orders commit and copy refresh, so the backup never lags the primary.
    writer: Mutex<()>,
}

impl LocalTodoStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, base_key: &str) -> Self {
        Self { kv, keys: StorageKeys::new(base_key), writer: Mutex::new(()) }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    pub fn get_metadata(&self) -> Option<StorageMetadata> {
        let raw = self.kv.get_item(&self.keys.metadata).ok()??;
        serde_json::from_str(&raw).ok()
    }

    fn reset_primary(&self) -> Vec<StoredTodoRecord> {
        warn!(key = %self.keys.primary, "stored todos corrupted and backup unusable, resetting");
        if let Err(e) = self.kv.remove_item(&self.keys.primary) {
            warn!(key = %self.keys.primary, error = %e, "failed to reset corrupted slot");
        }
        Vec::new()
    }

    fn recover_from_backup(&self) -> Option<Vec<StoredTodoRecord>> {
        let raw = match self.kv.get_item(&self.keys.backup) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.keys.backup, error = %e, "backup unreadable");
                return None;
            }
        };
        let records = serde_json::from_str::<Value>(&raw)
            .map_err(Error::from)
            .and_then(|value| decode_records(&value));
        match records {
            Ok(records) => {
                warn!(key = %self.keys.primary, count = records.len(), "restored todos from backup");
                if let Err(e) = self.write_records(&records) {
                    warn!(error = %e, "failed to repair primary slot from backup");
                }
                Some(records)
            }
            Err(e) => {
                warn!(key = %self.keys.backup, error = %e, "backup also corrupted");
                None
            }
        }
    }

    fn read_records(&self) -> Vec<StoredTodoRecord> {
        let raw = match self.kv.get_item(&self.keys.primary) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(key = %self.keys.primary, error = %e, "read failed");
                return self.recover_from_backup().unwrap_or_else(|| self.reset_primary());
            }
        };

        match parse_records(&raw) {
            Ok(records) => records,
            Err(e) => {
                warn!(key = %self.keys.primary, error = %e, "stored todos invalid, trying backup");
                self.recover_from_backup().unwrap_or_else(|| self.reset_primary())
            }
        }
    }

    fn write_records(&self, records: &[StoredTodoRecord]) -> Result<()> {
        let raw = serde_json::to_string(records)?;
        self.kv.set_item(&self.keys.primary, &raw)?;
        self.refresh_copies(&raw, records.len());
        Ok(())
    }

    /// Best-effort backup and metadata refresh after the primary slot changed.
    fn refresh_copies(&self, raw: &str, count: usize) {
        if let Err(e) = self.kv.set_item(&self.keys.backup, raw) {
            warn!(key = %self.keys.backup, error = %e, "failed to refresh backup");
        }

        let metadata = StorageMetadata {
            last_sync: now_millis(),
            version: STORAGE_SCHEMA_VERSION,
            item_count: count,
        };
        match serde_json::to_string(&metadata) {
            Ok(meta) => {
                if let Err(e) = self.kv.set_item(&self.keys.metadata, &meta) {
                    warn!(key = %self.keys.metadata, error = %e, "failed to update metadata");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode metadata"),
        }
        debug!(key = %self.keys.primary, count, "wrote todos");
    }

    /// Runs `mutate` over the dataset inside one atomic update of the primary
    /// slot. A slot that no longer parses is repaired through the read path
    /// and the mutation retried once.
    fn commit<T>(
        &self,
        mut mutate: impl FnMut(&mut Vec<StoredTodoRecord>) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.writer.lock();
        let mut repaired = false;
        loop {
            let mut outcome: Option<Result<(T, String, usize)>> = None;
            self.kv.update(&self.keys.primary, &mut |current| {
                let parsed = match current.as_deref() {
                    Some(raw) => parse_records(raw),
                    None => Ok(Vec::new()),
                };
                let result = parsed.and_then(|mut records| {
                    let value = mutate(&mut records)?;
                    Ok((value, serde_json::to_string(&records)?, records.len()))
                });
                let next = match &result {
                    Ok((_, raw, _)) => Some(raw.clone()),
                    Err(_) => current,
                };
                outcome = Some(result);
                next
            })?;

            match outcome {
                Some(Ok((value, raw, count))) => {
                    self.refresh_copies(&raw, count);
                    return Ok(value);
                }
                Some(Err(Error::Corruption(_))) if !repaired => {
                    repaired = true;
                    self.read_records();
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::Storage("dataset update did not run".into())),
            }
        }
    }

    fn checked(todo: &Todo) -> Result<StoredTodoRecord> {
        validate_todo(todo)?;
        Ok(StoredTodoRecord::stamp(todo.clone()))
    }
}

fn parse_records(raw: &str) -> Result<Vec<StoredTodoRecord>> {
    serde_json::from_str::<Value>(raw)
        .map_err(|e| Error::Corruption(e.to_string()))
        .and_then(|value| decode_records(&value))
        .map_err(|e| match e {
            Error::Corruption(_) => e,
            other => Error::Corruption(other.to_string()),
        })
}

impl TodoStore for LocalTodoStore {
    fn save(&self, todo: &Todo) -> Result<Todo> {
        let record = Self::checked(todo)?;
        self.commit(|records| {
            match records.iter_mut().find(|r| r.todo.id == todo.id) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
            Ok(())
        })?;
        Ok(todo.clone())
    }

    fn get(&self, id: &str) -> Result<Option<Todo>> {
        Ok(self
            .read_records()
            .into_iter()
            .find(|r| r.todo.id == id)
            .map(StoredTodoRecord::into_todo))
    }

    fn get_all(&self) -> Result<Vec<Todo>> {
        Ok(self
            .read_records()
            .into_iter()
            .map(StoredTodoRecord::into_todo)
            .collect())
    }

    fn update(&self, id: &str, patch: &TodoPatch) -> Result<Option<Todo>> {
        self.commit(|records| {
            let Some(slot) = records.iter_mut().find(|r| r.todo.id == id) else {
                return Ok(None);
            };
            let updated = slot.todo.with_patch(patch, now_utc());
            *slot = Self::checked(&updated)?;
            Ok(Some(updated))
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.commit(|records| {
            records.retain(|r| r.todo.id != id);
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        self.kv.remove_item(&self.keys.primary)
    }
}
