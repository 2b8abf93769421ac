mod broadcast;
mod manager;
mod message;
mod outbox;
mod polling;
mod provider;

pub use broadcast::{BroadcastChannel, BroadcastHub};
pub use manager::{
    detect_broadcast, SyncEnvironment, SyncManager, SyncManagerOptions, TransportMode,
};
pub use message::{Resource, SyncAction, SyncMessage};
pub use outbox::SyncOutbox;
pub use polling::{PollingQueue, QueuedMessage};
pub use provider::{ApplyFn, SyncProvider, SyncSnapshot, SyncStatus};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::storage::{now_millis, random_suffix};

pub type MessageHandler = Arc<dyn Fn(SyncMessage) + Send + Sync>;

pub fn create_source_id() -> String {
    format!("tab-{}-{}", now_millis(), random_suffix(6))
}

pub(crate) fn runtime_handle() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|e| Error::Transport(format!("no async runtime for sync listener: {}", e)))
}

/// A live listener. Dropping it or calling [`Subscription::unsubscribe`]
/// stops delivery; no callback fires once either returns.
pub struct Subscription {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        active: Arc<AtomicBool>,
        task: JoinHandle<()>,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { active, task: Some(task), on_close }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
