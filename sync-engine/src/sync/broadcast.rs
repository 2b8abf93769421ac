use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{runtime_handle, MessageHandler, Subscription, SyncMessage};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Envelope {
    sender: u64,
    payload: Arc<str>,
}

/// Named in-process pub/sub channels shared by every tab of one process.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
    next_instance: Arc<AtomicU64>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str) -> BroadcastChannel {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        BroadcastChannel {
            name: name.to_string(),
            instance: self.next_instance.fetch_add(1, Ordering::Relaxed),
            sender,
            closed: AtomicBool::new(false),
        }
    }
}

/// One tab's handle on a named channel. Posts are never echoed back to the
/// handle that sent them.
pub struct BroadcastChannel {
    name: String,
    instance: u64,
    sender: broadcast::Sender<Envelope>,
    closed: AtomicBool,
}

impl BroadcastChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, message: &SyncMessage) -> Result<()> {
        self.post_raw(&message.to_json()?)
    }

    /// Posts an arbitrary payload. Receivers validate and drop anything that
    /// is not a well-formed message.
    pub fn post_raw(&self, payload: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(format!("channel {} is closed", self.name)));
        }
        let envelope = Envelope { sender: self.instance, payload: Arc::from(payload) };
        // Err only means nobody is subscribed right now.
        if self.sender.send(envelope).is_err() {
            debug!(channel = %self.name, "no receivers for broadcast");
        }
        Ok(())
    }

    pub fn listen(&self, source: &str, handler: MessageHandler) -> Result<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(format!("channel {} is closed", self.name)));
        }
        let handle = runtime_handle()?;
        let mut rx = self.sender.subscribe();
        let active = Arc::new(AtomicBool::new(true));

        let task_active = active.clone();
        let instance = self.instance;
        let channel = self.name.clone();
        let source = source.to_string();
        let task = handle.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.sender == instance {
                            continue;
                        }
                        match SyncMessage::from_json(&envelope.payload) {
                            Ok(message) if message.source == source => {
                                debug!(%channel, "ignoring own message from another handle");
                            }
                            Ok(message) => {
                                if !task_active.load(Ordering::SeqCst) {
                                    break;
                                }
                                handler(message);
                            }
                            Err(e) => warn!(%channel, error = %e, "dropping malformed sync message"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%channel, skipped, "broadcast listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(active, task, None))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncAction;
    use serde_json::json;
    use std::time::Duration;

    fn collector() -> (MessageHandler, Arc<Mutex<Vec<SyncMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |m| sink.lock().push(m)), seen)
    }

    #[tokio::test]
    async fn test_delivers_to_other_handles_only() {
        let hub = BroadcastHub::new();
        let a = hub.open("todos");
        let b = hub.open("todos");
        let (on_a, seen_a) = collector();
        let (on_b, seen_b) = collector();
        let _sa = a.listen("tab-a", on_a).unwrap();
        let _sb = b.listen("tab-b", on_b).unwrap();

        a.post(&SyncMessage::deleted("c1", "tab-a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen_a.lock().is_empty());
        assert_eq!(seen_b.lock().len(), 1);
        assert_eq!(seen_b.lock()[0].action, SyncAction::Deleted);
    }

    #[tokio::test]
    async fn test_channels_are_isolated_by_name() {
        let hub = BroadcastHub::new();
        let a = hub.open("todos");
        let other = hub.open("notes");
        let (on_other, seen) = collector();
        let _s = other.listen("tab-b", on_other).unwrap();

        a.post(&SyncMessage::sync_request("tab-a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_dropped() {
        let hub = BroadcastHub::new();
        let a = hub.open("todos");
        let b = hub.open("todos");
        let (on_b, seen) = collector();
        let _s = b.listen("tab-b", on_b).unwrap();

        a.post_raw("not json").unwrap();
        a.post_raw(&json!({"resource": "todo", "action": "created"}).to_string()).unwrap();
        a.post(&SyncMessage::sync_request("tab-a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let hub = BroadcastHub::new();
        let a = hub.open("todos");
        let b = hub.open("todos");
        let (on_b, seen) = collector();
        let mut sub = b.listen("tab-b", on_b).unwrap();

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        a.post(&SyncMessage::sync_request("tab-a")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());

        a.close();
        assert!(a.is_closed());
        assert!(matches!(
            a.post(&SyncMessage::sync_request("tab-a")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_listen_without_runtime_fails() {
        let hub = BroadcastHub::new();
        let (handler, _) = collector();
        assert!(matches!(
            hub.open("todos").listen("tab-a", handler),
            Err(Error::Transport(_))
        ));
    }
}
