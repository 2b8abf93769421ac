use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::KeyValueStore;
use crate::error::{Error, Result};

/// In-process key-value slots. Clones share the same map, which is how tabs
/// of one process see a common "local storage".
#[derive(Clone, Default)]
pub struct MemoryKv {
    slots: Arc<Mutex<HashMap<String, String>>>,
    quota_bytes: Option<usize>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects writes once the stored bytes would exceed `bytes`, like a full
    /// browser quota.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            slots: Arc::default(),
            quota_bytes: Some(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.slots.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_quota(
        &self,
        slots: &HashMap<String, String>,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let used: usize = slots
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if used + key.len() + value.len() > quota {
            return Err(Error::Storage(format!("quota exceeded writing {}", key)));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKv {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.slots.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        self.check_quota(&slots, key, value)?;
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.slots.lock().remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Option<String>,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        match f(slots.get(key).cloned()) {
            Some(value) => {
                self.check_quota(&slots, key, &value)?;
                slots.insert(key.to_string(), value);
            }
            None => {
                slots.remove(key);
            }
        }
        Ok(())
    }
}
