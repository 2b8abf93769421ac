use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{runtime_handle, MessageHandler, Subscription, SyncMessage};
use crate::error::{Error, Result};
use crate::storage::{now_millis, random_suffix, KeyValueStore};

/// A listener that has not polled for this many of its own intervals is
/// dropped from the registry and stops holding messages in the queue.
const STALE_AFTER_POLLS: u64 = 50;

/// A message sitting in the shared queue slot.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: String,
    pub message: SyncMessage,
    pub delivered_to: Vec<String>,
}

impl QueuedMessage {
    fn to_value(&self) -> Result<Value> {
        let mut value = serde_json::to_value(&self.message)?;
        if let Value::Object(map) = &mut value {
            map.insert("id".into(), Value::String(self.id.clone()));
            map.insert("deliveredTo".into(), serde_json::to_value(&self.delivered_to)?);
        }
        Ok(value)
    }

    fn from_value(value: Value) -> Result<Self> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Validation("queued message has no id".into()))?
            .to_string();
        let delivered_to = match value.get("deliveredTo") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::Validation(format!("bad deliveredTo: {}", e)))?,
        };
        let message = SyncMessage::from_value(value)?;
        Ok(Self { id, message, delivered_to })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenerRecord {
    source: String,
    last_seen: u64,
    interval_ms: u64,
}

impl ListenerRecord {
    fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > self.interval_ms.saturating_mul(STALE_AFTER_POLLS)
    }
}

struct Listener {
    id: String,
    source: String,
    interval_ms: u64,
}

fn parse_queue(raw: Option<&str>) -> Vec<QueuedMessage> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match QueuedMessage::from_value(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "dropping malformed queued sync message");
                    None
                }
            })
            .collect(),
        _ => {
            warn!("sync queue is corrupted, resetting");
            Vec::new()
        }
    }
}

fn encode_queue(entries: &[QueuedMessage]) -> Result<Option<String>> {
    if entries.is_empty() {
        return Ok(None);
    }
    let values = entries.iter().map(QueuedMessage::to_value).collect::<Result<Vec<_>>>()?;
    Ok(Some(serde_json::to_string(&values)?))
}

fn parse_registry(raw: Option<&str>) -> HashMap<String, ListenerRecord> {
    let Some(raw) = raw else {
        return HashMap::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "listener registry is corrupted, resetting");
        HashMap::new()
    })
}

/// Cross-tab delivery through a shared key-value slot, for environments
/// without a broadcast channel.
///
/// The queue slot holds a JSON array of messages. A registry slot next to it
/// records every live listener. An entry stays queued until each live
/// listener with a different source has taken it, so delivery is
/// at-most-once per listener.
#[derive(Clone)]
pub struct PollingQueue {
    kv: Arc<dyn KeyValueStore>,
    queue_key: String,
    registry_key: String,
}

impl PollingQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>, sync_key: &str) -> Self {
        Self {
            kv,
            queue_key: sync_key.to_string(),
            registry_key: format!("{}-listeners", sync_key),
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn send(&self, message: &SyncMessage) -> Result<String> {
        message.validate()?;
        let entry = QueuedMessage {
            id: format!("{}-{}-{}", message.source, now_millis(), random_suffix(6)),
            message: message.clone(),
            delivered_to: Vec::new(),
        };

        let mut failure = None;
        self.kv.update(&self.queue_key, &mut |raw| {
            let mut entries = parse_queue(raw.as_deref());
            entries.push(entry.clone());
            match encode_queue(&entries) {
                Ok(encoded) => encoded,
                Err(e) => {
                    failure = Some(e);
                    raw
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(entry.id),
        }
    }

    /// What is currently queued, without consuming anything.
    pub fn pending(&self) -> Result<Vec<QueuedMessage>> {
        Ok(parse_queue(self.kv.get_item(&self.queue_key)?.as_deref()))
    }

    pub fn listener_count(&self) -> Result<usize> {
        let now = now_millis();
        Ok(parse_registry(self.kv.get_item(&self.registry_key)?.as_deref())
            .values()
            .filter(|r| !r.is_stale(now))
            .count())
    }

    pub fn listen(
        &self,
        source: &str,
        interval: Duration,
        handler: MessageHandler,
    ) -> Result<Subscription> {
        let handle = runtime_handle()?;
        let interval = interval.max(Duration::from_millis(1));
        let listener = Listener {
            id: format!("listener-{}", random_suffix(10)),
            source: source.to_string(),
            interval_ms: interval.as_millis() as u64,
        };
        self.touch(&listener)?;

        let active = Arc::new(AtomicBool::new(true));
        let task_active = active.clone();
        let queue = self.clone();
        let listener_id = listener.id.clone();
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !task_active.load(Ordering::SeqCst) {
                    break;
                }
                let delivered = match queue.poll(&listener) {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        warn!(listener = %listener.id, error = %e, "sync poll failed");
                        continue;
                    }
                };
                for message in delivered {
                    if !task_active.load(Ordering::SeqCst) {
                        break;
                    }
                    handler(message);
                }
            }
        });

        let queue = self.clone();
        let on_close: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Err(e) = queue.deregister(&listener_id) {
                warn!(listener = %listener_id, error = %e, "failed to deregister sync listener");
            }
        });
        Ok(Subscription::new(active, task, Some(on_close)))
    }

    /// Marks the listener alive, prunes stale ones, and returns the live set.
    fn touch(&self, listener: &Listener) -> Result<HashMap<String, ListenerRecord>> {
        let now = now_millis();
        let mut live = HashMap::new();
        let mut failure = None;
        self.kv.update(&self.registry_key, &mut |raw| {
            let mut registry = parse_registry(raw.as_deref());
            registry.insert(
                listener.id.clone(),
                ListenerRecord {
                    source: listener.source.clone(),
                    last_seen: now,
                    interval_ms: listener.interval_ms,
                },
            );
            registry.retain(|id, record| {
                let keep = !record.is_stale(now);
                if !keep {
                    debug!(listener = %id, "pruning stale sync listener");
                }
                keep
            });
            live = registry.clone();
            match serde_json::to_string(&registry) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    failure = Some(Error::from(e));
                    raw
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(live),
        }
    }

    fn deregister(&self, listener_id: &str) -> Result<()> {
        let mut failure = None;
        self.kv.update(&self.registry_key, &mut |raw| {
            let mut registry = parse_registry(raw.as_deref());
            registry.remove(listener_id);
            if registry.is_empty() {
                return None;
            }
            match serde_json::to_string(&registry) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    failure = Some(Error::from(e));
                    raw
                }
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    /// Takes every entry this listener has not seen yet and drops entries no
    /// live listener still needs.
    fn poll(&self, listener: &Listener) -> Result<Vec<SyncMessage>> {
        let live = self.touch(listener)?;
        let mut delivered = Vec::new();
        let mut failure = None;
        self.kv.update(&self.queue_key, &mut |raw| {
            delivered.clear();
            let mut entries = parse_queue(raw.as_deref());
            for entry in entries.iter_mut() {
                if entry.message.source == listener.source
                    || entry.delivered_to.contains(&listener.id)
                {
                    continue;
                }
                entry.delivered_to.push(listener.id.clone());
                delivered.push(entry.message.clone());
            }
            entries.retain(|entry| {
                live.iter().any(|(id, record)| {
                    record.source != entry.message.source && !entry.delivered_to.contains(id)
                })
            });
            match encode_queue(&entries) {
                Ok(encoded) => encoded,
                Err(e) => {
                    failure = Some(e);
                    delivered.clear();
                    raw
                }
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }
}
