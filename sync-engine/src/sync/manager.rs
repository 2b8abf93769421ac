use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{
    BroadcastChannel, BroadcastHub, MessageHandler, PollingQueue, Subscription, SyncMessage,
};
use crate::config::{DEFAULT_CHANNEL, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SYNC_KEY};
use crate::error::{Error, Result};
use crate::storage::{Capability, KeyValueStore};

/// What the host offers for cross-tab messaging.
#[derive(Clone)]
pub struct SyncEnvironment {
    pub broadcast: Option<BroadcastHub>,
    pub shared: Arc<dyn KeyValueStore>,
    pub sync_key: String,
}

impl SyncEnvironment {
    pub fn with_broadcast(hub: BroadcastHub, shared: Arc<dyn KeyValueStore>) -> Self {
        Self { broadcast: Some(hub), shared, sync_key: DEFAULT_SYNC_KEY.to_string() }
    }

    pub fn polling_only(shared: Arc<dyn KeyValueStore>) -> Self {
        Self { broadcast: None, shared, sync_key: DEFAULT_SYNC_KEY.to_string() }
    }

    pub fn sync_key(mut self, key: impl Into<String>) -> Self {
        self.sync_key = key.into();
        self
    }
}

pub fn detect_broadcast(env: &SyncEnvironment) -> Capability {
    if env.broadcast.is_some() {
        Capability::Available
    } else {
        Capability::Unavailable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Broadcast,
    Polling,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Broadcast => "broadcast",
            TransportMode::Polling => "polling",
        }
    }
}

pub struct SyncManagerOptions {
    pub source: String,
    pub channel_name: String,
    pub poll_interval: Duration,
    pub on_message: MessageHandler,
}

impl SyncManagerOptions {
    pub fn new(source: impl Into<String>, on_message: MessageHandler) -> Self {
        Self {
            source: source.into(),
            channel_name: DEFAULT_CHANNEL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            on_message,
        }
    }

    pub fn channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

enum Transport {
    Broadcast(BroadcastChannel),
    Polling(PollingQueue),
}

/// One tab's endpoint: sends to every other tab and hands what arrives to the
/// `on_message` callback. Broadcast is used when the environment has it,
/// polling the shared store otherwise.
pub struct SyncManager {
    source: String,
    mode: TransportMode,
    transport: Transport,
    subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl SyncManager {
    /// Never fails: if the listener cannot start, the manager still sends
    /// and the failure is logged.
    pub fn new(env: &SyncEnvironment, options: SyncManagerOptions) -> Self {
        let SyncManagerOptions { source, channel_name, poll_interval, on_message } = options;

        let (mode, transport, listening) = match &env.broadcast {
            Some(hub) => {
                let channel = hub.open(&channel_name);
                let listening = channel.listen(&source, on_message);
                (TransportMode::Broadcast, Transport::Broadcast(channel), listening)
            }
            None => {
                let queue = PollingQueue::new(env.shared.clone(), &env.sync_key);
                let listening = queue.listen(&source, poll_interval, on_message);
                (TransportMode::Polling, Transport::Polling(queue), listening)
            }
        };

        let subscription = match listening {
            Ok(sub) => Some(sub),
            Err(e) => {
                error!(%source, mode = mode.as_str(), error = %e, "failed to start sync listener");
                None
            }
        };
        info!(%source, mode = mode.as_str(), "sync manager started");

        Self {
            source,
            mode,
            transport,
            subscription: Mutex::new(subscription),
            closed: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_listening(&self) -> bool {
        self.subscription.lock().as_ref().is_some_and(Subscription::is_active)
    }

    pub fn send(&self, message: &SyncMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("sync manager is closed".into()));
        }
        message.validate()?;
        match &self.transport {
            Transport::Broadcast(channel) => channel.post(message),
            Transport::Polling(queue) => queue.send(message).map(|id| {
                debug!(%id, "queued sync message");
            }),
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut sub) = self.subscription.lock().take() {
            sub.unsubscribe();
        }
        if let Transport::Broadcast(channel) = &self.transport {
            channel.close();
        }
        debug!(source = %self.source, "sync manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.close();
    }
}
