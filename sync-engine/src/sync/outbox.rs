use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::SyncMessage;
use crate::config::DEFAULT_OUTBOX_CAPACITY;
use crate::error::Result;
use crate::storage::now_millis;

/// Bounded FIFO of messages waiting for a sync target. When full, the oldest
/// message is evicted to make room.
pub struct SyncOutbox {
    capacity: usize,
    queue: Mutex<VecDeque<SyncMessage>>,
}

impl Default for SyncOutbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl SyncOutbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, queue: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends the message, stamping it if its timestamp is unset, and
    /// returns what was stored.
    pub fn enqueue(&self, mut message: SyncMessage) -> SyncMessage {
        if message.timestamp == 0 {
            message.timestamp = now_millis();
        }
        let mut queue = self.queue.lock();
        let overflow = (queue.len() + 1).saturating_sub(self.capacity);
        if overflow > 0 {
            queue.drain(..overflow);
            warn!(dropped = overflow, "dropped {} oldest operation(s)", overflow);
        }
        queue.push_back(message.clone());
        message
    }

    pub fn dequeue(&self) -> Option<SyncMessage> {
        self.queue.lock().pop_front()
    }

    pub fn is_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn snapshot(&self) -> Vec<SyncMessage> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Hands queued messages to `send` oldest first and returns the ones that
    /// went through. On the first failure the failed message and everything
    /// after it go back to the front of the queue, ahead of anything enqueued
    /// meanwhile.
    pub async fn flush<F, Fut>(&self, mut send: F) -> Vec<SyncMessage>
    where
        F: FnMut(SyncMessage) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let batch: Vec<SyncMessage> = self.queue.lock().drain(..).collect();
        let total = batch.len();

        for (index, message) in batch.iter().enumerate() {
            if let Err(e) = send(message.clone()).await {
                let mut queue = self.queue.lock();
                for unsent in batch[index..].iter().rev() {
                    queue.push_front(unsent.clone());
                }
                warn!(
                    delivered = index,
                    requeued = total - index,
                    error = %e,
                    "outbox flush interrupted"
                );
                return batch[..index].to_vec();
            }
        }
        debug!(delivered = total, "outbox flushed");
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sync::SyncAction;
    use serde_json::json;

    fn message(n: u64) -> SyncMessage {
        let mut m = SyncMessage::new(SyncAction::Updated, json!({ "n": n }), "tab-a");
        m.timestamp = n;
        m
    }

    #[test]
    fn test_fifo_and_stamping() {
        let outbox = SyncOutbox::default();
        assert_eq!(outbox.capacity(), 100);
        assert!(!outbox.is_pending());

        let mut unstamped = message(0);
        unstamped.timestamp = 0;
        let stored = outbox.enqueue(unstamped);
        assert!(stored.timestamp > 0);
        outbox.enqueue(message(7));

        assert_eq!(outbox.dequeue().unwrap().timestamp, stored.timestamp);
        assert_eq!(outbox.dequeue().unwrap().timestamp, 7);
        assert!(outbox.dequeue().is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let outbox = SyncOutbox::new(100);
        for n in 1..=101 {
            outbox.enqueue(message(n));
        }
        assert_eq!(outbox.len(), 100);
        assert_eq!(outbox.dequeue().unwrap().timestamp, 2);
        let rest = outbox.snapshot();
        assert_eq!(rest.last().unwrap().timestamp, 101);
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let outbox = SyncOutbox::default();
        for n in 1..=3 {
            outbox.enqueue(message(n));
        }
        let mut sent = Vec::new();
        let delivered = outbox
            .flush(|m| {
                sent.push(m.timestamp);
                async { Ok(()) }
            })
            .await;
        assert_eq!(delivered.len(), 3);
        assert_eq!(sent, vec![1, 2, 3]);
        assert!(!outbox.is_pending());
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_rest() {
        let outbox = SyncOutbox::default();
        for n in 1..=5 {
            outbox.enqueue(message(n));
        }
        let delivered = outbox
            .flush(|m| async move {
                if m.timestamp == 3 {
                    Err(Error::remote(Some(503), "offline"))
                } else {
                    Ok(())
                }
            })
            .await;

        let delivered: Vec<u64> = delivered.iter().map(|m| m.timestamp).collect();
        assert_eq!(delivered, vec![1, 2]);
        assert!(outbox.is_pending());
        let left: Vec<u64> = outbox.snapshot().iter().map(|m| m.timestamp).collect();
        assert_eq!(left, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_flush_of_empty_outbox() {
        let outbox = SyncOutbox::default();
        let delivered = outbox.flush(|_| async { Ok(()) }).await;
        assert!(delivered.is_empty());
    }
}
