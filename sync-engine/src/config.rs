use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_STORAGE_KEY: &str = "todos";
pub const DEFAULT_RECOVERY_KEY: &str = "todo-recovery";
pub const DEFAULT_SYNC_KEY: &str = "todos-sync";
pub const DEFAULT_CHANNEL: &str = "todos";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CRASH_THRESHOLD_MS: u64 = 5000;

/// Tunables for the storage, sync and recovery layers.
///
/// Every field has a default, so a JSON document only needs the keys it
/// wants to override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    pub storage_key: String,
    pub recovery_key: String,
    pub sync_key: String,
    pub channel_name: String,
    pub poll_interval_ms: u64,
    pub outbox_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub crash_threshold_ms: u64,
    pub sqlite_path: Option<PathBuf>,
    pub remote_base_url: Option<String>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            recovery_key: DEFAULT_RECOVERY_KEY.to_string(),
            sync_key: DEFAULT_SYNC_KEY.to_string(),
            channel_name: DEFAULT_CHANNEL.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            crash_threshold_ms: DEFAULT_CRASH_THRESHOLD_MS,
            sqlite_path: None,
            remote_base_url: None,
        }
    }
}

impl ResilienceConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let keys = [
            ("storageKey", &self.storage_key),
            ("recoveryKey", &self.recovery_key),
            ("syncKey", &self.sync_key),
            ("channelName", &self.channel_name),
        ];
        for (name, value) in keys {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("{} must not be empty", name)));
            }
        }
        if self.storage_key == self.recovery_key || self.storage_key == self.sync_key {
            return Err(Error::Validation(
                "storageKey must differ from recoveryKey and syncKey".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(Error::Validation("intervals must be greater than zero".into()));
        }
        if self.outbox_capacity == 0 {
            return Err(Error::Validation("outboxCapacity must be greater than zero".into()));
        }
        if self.crash_threshold_ms <= self.heartbeat_interval_ms {
            return Err(Error::Validation(
                "crashThresholdMs must exceed heartbeatIntervalMs".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
