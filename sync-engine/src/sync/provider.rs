use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::{SyncEnvironment, SyncManager, SyncManagerOptions, SyncMessage};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self { status: SyncStatus::Synced, last_sync_time: None, sync_error: None }
    }
}

pub type ApplyFn = Arc<dyn Fn(&SyncMessage) -> Result<()> + Send + Sync>;

struct Shared {
    state: Mutex<SyncSnapshot>,
    active: AtomicBool,
}

impl Shared {
    fn handle(&self, apply: &ApplyFn, message: SyncMessage) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.status = SyncStatus::Syncing;
            state.sync_error = None;
        }

        let result = message.validate().and_then(|_| apply(&message));
        if !self.active.load(Ordering::SeqCst) {
            debug!("ignoring sync result after teardown");
            return;
        }

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.status = SyncStatus::Synced;
                state.last_sync_time = DateTime::<Utc>::from_timestamp_millis(message.timestamp as i64)
                    .or_else(|| Some(Utc::now()));
            }
            Err(e) => {
                warn!(source = %message.source, error = %e, "failed to apply sync message");
                state.status = SyncStatus::Error;
                state.sync_error = Some(e.to_string());
            }
        }
    }
}

/// Owns a tab's [`SyncManager`] and tracks the outcome of applying what it
/// receives.
pub struct SyncProvider {
    shared: Arc<Shared>,
    manager: SyncManager,
}

impl SyncProvider {
    pub fn start(env: &SyncEnvironment, options: SyncManagerOptions, apply: ApplyFn) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SyncSnapshot::default()),
            active: AtomicBool::new(true),
        });

        let handler_shared = shared.clone();
        let options = SyncManagerOptions {
            on_message: Arc::new(move |message| handler_shared.handle(&apply, message)),
            ..options
        };
        let manager = SyncManager::new(env, options);
        Self { shared, manager }
    }

    pub fn status(&self) -> SyncSnapshot {
        self.shared.state.lock().clone()
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn broadcast(&self, message: &SyncMessage) -> Result<()> {
        self.manager.send(message)
    }

    pub fn close(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.manager.close();
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.close();
    }
}
