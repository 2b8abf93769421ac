use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{
    ResilienceConfig, DEFAULT_CRASH_THRESHOLD_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_RECOVERY_KEY,
};
use crate::error::{Error, Result};
use crate::storage::{now_millis, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    pub last_active: u64,
    #[serde(default)]
    pub pending_operations: Vec<PendingOperation>,
}

impl RecoveryState {
    fn fresh() -> Self {
        Self { last_active: now_millis(), pending_operations: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Active,
    Crashed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryStartup {
    pub has_crashed: bool,
    pub pending_operations: Vec<PendingOperation>,
}

/// Background cache worker installed at startup. Registration failures are
/// logged and never abort recovery.
#[async_trait]
pub trait OfflineCacheWorker: Send + Sync {
    async fn register(&self) -> Result<()>;
}

/// The recovery slot. Every failure here is logged and read as "no state".
#[derive(Clone)]
struct RecoverySlot {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl RecoverySlot {
    fn parse(&self, raw: Option<&str>) -> Option<RecoveryState> {
        let raw = raw?;
        match serde_json::from_str(raw) {
            Ok(state) => Some(state),
            Err(e) => {
                error!(key = %self.key, error = %e, "failed to load recovery state");
                None
            }
        }
    }

    fn load(&self) -> Option<RecoveryState> {
        match self.kv.get_item(&self.key) {
            Ok(raw) => self.parse(raw.as_deref()),
            Err(e) => {
                error!(key = %self.key, error = %e, "failed to load recovery state");
                None
            }
        }
    }

    fn modify<T>(&self, create: bool, f: impl FnOnce(&mut RecoveryState) -> T) -> Option<T> {
        self.modify_while(None, create, f)
    }

    /// Read-modify-write under the store's lock. With `create` unset an
    /// absent state is left absent; with `live` cleared nothing is written.
    fn modify_while<T>(
        &self,
        live: Option<&AtomicBool>,
        create: bool,
        f: impl FnOnce(&mut RecoveryState) -> T,
    ) -> Option<T> {
        let mut f = Some(f);
        let mut output = None;
        let result = self.kv.update(&self.key, &mut |raw| {
            if live.is_some_and(|live| !live.load(Ordering::SeqCst)) {
                return raw;
            }
            let state = match self.parse(raw.as_deref()) {
                Some(state) => Some(state),
                None if create => Some(RecoveryState::fresh()),
                None => None,
            };
            let Some(mut state) = state else {
                return raw;
            };
            if let Some(f) = f.take() {
                output = Some(f(&mut state));
            }
            match serde_json::to_string(&state) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    error!(key = %self.key, error = %e, "failed to save recovery state");
                    output = None;
                    raw
                }
            }
        });
        if let Err(e) = result {
            error!(key = %self.key, error = %e, "failed to save recovery state");
            return None;
        }
        output
    }

    fn clear(&self) {
        if let Err(e) = self.kv.remove_item(&self.key) {
            error!(key = %self.key, error = %e, "failed to clear recovery state");
        }
    }

    fn beat(&self) {
        self.modify(true, |state| state.last_active = now_millis());
    }

    /// A tick of a running heartbeat. `stop` clears the flag before clearing
    /// the slot, and both go through the store's lock.
    fn beat_while(&self, live: &AtomicBool) {
        self.modify_while(Some(live), true, |state| state.last_active = now_millis());
    }
}

/// A running heartbeat. `stop` ends it and clears the recovery state, which
/// marks a clean shutdown. Dropping the handle without `stop` only ends the
/// task.
pub struct HeartbeatHandle {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    slot: RecoverySlot,
}

impl HeartbeatHandle {
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.slot.clear();
        debug!(key = %self.slot.key, "heartbeat stopped");
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Heartbeat liveness plus a durable log of mutations the remote has not
/// confirmed yet. A session whose last heartbeat is older than the
/// threshold is treated as crashed.
pub struct CrashRecovery {
    slot: RecoverySlot,
    crash_threshold_ms: u64,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl CrashRecovery {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            slot: RecoverySlot { kv, key: DEFAULT_RECOVERY_KEY.to_string() },
            crash_threshold_ms: DEFAULT_CRASH_THRESHOLD_MS,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn from_config(kv: Arc<dyn KeyValueStore>, config: &ResilienceConfig) -> Self {
        Self::new(kv)
            .with_key(&config.recovery_key)
            .with_crash_threshold(config.crash_threshold_ms)
            .with_heartbeat_interval(config.heartbeat_interval())
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.slot.key = key.to_string();
        self
    }

    pub fn with_crash_threshold(mut self, threshold_ms: u64) -> Self {
        self.crash_threshold_ms = threshold_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn key(&self) -> &str {
        &self.slot.key
    }

    pub fn load_state(&self) -> Option<RecoveryState> {
        self.slot.load()
    }

    pub fn session_state(&self) -> SessionState {
        match self.slot.load() {
            None => SessionState::NoSession,
            Some(state) if now_millis().saturating_sub(state.last_active) > self.crash_threshold_ms => {
                SessionState::Crashed
            }
            Some(_) => SessionState::Active,
        }
    }

    pub fn detect_crash(&self) -> bool {
        self.session_state() == SessionState::Crashed
    }

    pub fn update_heartbeat(&self) {
        self.slot.beat();
    }

    /// Beats now, then on every interval until the handle is stopped.
    pub fn start_heartbeat(&self) -> Result<HeartbeatHandle> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InvalidState(format!("heartbeat needs an async runtime: {}", e)))?;
        self.slot.beat();

        let active = Arc::new(AtomicBool::new(true));
        let task_active = active.clone();
        let slot = self.slot.clone();
        let interval = self.heartbeat_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !task_active.load(Ordering::SeqCst) {
                    break;
                }
                slot.beat_while(&task_active);
            }
        });

        Ok(HeartbeatHandle { active, task: Some(task), slot: self.slot.clone() })
    }

    pub fn add_pending_operation(
        &self,
        kind: OperationKind,
        todo_id: Option<&str>,
        data: Option<Value>,
    ) {
        let op = PendingOperation { kind, todo_id: todo_id.map(str::to_string), data };
        self.slot.modify(true, |state| state.pending_operations.push(op));
    }

    /// Drops the oldest pending entry of this kind for this todo. Returns
    /// whether one was found.
    pub fn settle_operation(&self, kind: OperationKind, todo_id: &str) -> bool {
        self.slot
            .modify(false, |state| {
                let position = state
                    .pending_operations
                    .iter()
                    .position(|op| op.kind == kind && op.todo_id.as_deref() == Some(todo_id));
                position.map(|i| state.pending_operations.remove(i)).is_some()
            })
            .unwrap_or(false)
    }

    /// Returns and clears the pending log; a second call sees nothing.
    pub fn get_pending_operations(&self) -> Vec<PendingOperation> {
        self.slot
            .modify(false, |state| std::mem::take(&mut state.pending_operations))
            .unwrap_or_default()
    }

    pub async fn initialize_crash_recovery(
        &self,
        worker: Option<&dyn OfflineCacheWorker>,
    ) -> RecoveryStartup {
        let has_crashed = self.detect_crash();
        let pending_operations =
            if has_crashed { self.get_pending_operations() } else { Vec::new() };
        if has_crashed {
            warn!(pending = pending_operations.len(), "previous session crashed");
        }

        match self.start_heartbeat() {
            Ok(handle) => {
                if let Some(mut previous) = self.heartbeat.lock().replace(handle) {
                    previous.stop();
                    self.slot.beat();
                }
            }
            Err(e) => error!(error = %e, "failed to start heartbeat"),
        }

        match worker {
            Some(worker) => match worker.register().await {
                Ok(()) => info!("offline cache worker registered"),
                Err(e) => error!(error = %e, "offline cache worker registration failed"),
            },
            None => debug!("no offline cache worker"),
        }

        RecoveryStartup { has_crashed, pending_operations }
    }

    /// Stops the heartbeat started by `initialize_crash_recovery`, clearing
    /// the recovery state.
    pub fn shutdown(&self) {
        if let Some(mut handle) = self.heartbeat.lock().take() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn tracker() -> (CrashRecovery, MemoryKv) {
        let kv = MemoryKv::new();
        (CrashRecovery::new(Arc::new(kv.clone())), kv)
    }

    fn write_state(kv: &MemoryKv, last_active: u64, ops: Value) {
        let raw = json!({ "lastActive": last_active, "pendingOperations": ops });
        kv.set_item(DEFAULT_RECOVERY_KEY, &raw.to_string()).unwrap();
    }

    #[test]
    fn test_crash_detection() {
        let (recovery, kv) = tracker();
        assert_eq!(recovery.session_state(), SessionState::NoSession);
        assert!(!recovery.detect_crash());

        write_state(&kv, now_millis() - 10_000, json!([]));
        assert!(recovery.detect_crash());

        write_state(&kv, now_millis() - 1_000, json!([]));
        assert!(!recovery.detect_crash());
        assert_eq!(recovery.session_state(), SessionState::Active);
    }

    #[test]
    fn test_heartbeat_creates_state() {
        let (recovery, _) = tracker();
        recovery.update_heartbeat();
        let state = recovery.load_state().unwrap();
        assert!(now_millis() - state.last_active < 1_000);
        assert!(state.pending_operations.is_empty());
    }

    #[test]
    fn test_pending_operations_are_consumed_once() {
        let (recovery, kv) = tracker();
        recovery.add_pending_operation(OperationKind::Create, None, Some(json!({"title": "a"})));
        recovery.add_pending_operation(OperationKind::Delete, Some("c1"), None);

        let raw = kv.get_item(DEFAULT_RECOVERY_KEY).unwrap().unwrap();
        assert!(raw.contains("\"type\":\"create\""));
        assert!(raw.contains("\"todoId\":\"c1\""));

        let ops = recovery.get_pending_operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OperationKind::Create);
        assert_eq!(ops[1].todo_id.as_deref(), Some("c1"));
        assert!(recovery.get_pending_operations().is_empty());
    }

    #[test]
    fn test_settle_removes_oldest_match() {
        let (recovery, _) = tracker();
        assert!(!recovery.settle_operation(OperationKind::Update, "c1"));

        recovery.add_pending_operation(OperationKind::Update, Some("c1"), Some(json!({"n": 1})));
        recovery.add_pending_operation(OperationKind::Update, Some("c2"), None);
        recovery.add_pending_operation(OperationKind::Update, Some("c1"), Some(json!({"n": 2})));

        assert!(recovery.settle_operation(OperationKind::Update, "c1"));
        let ops = recovery.get_pending_operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].data, Some(json!({"n": 2})));
    }

    #[test]
    fn test_corrupt_state_reads_as_none() {
        let (recovery, kv) = tracker();
        kv.set_item(DEFAULT_RECOVERY_KEY, "{{{").unwrap();
        assert!(recovery.load_state().is_none());
        assert!(!recovery.detect_crash());
        assert!(recovery.get_pending_operations().is_empty());

        recovery.update_heartbeat();
        assert!(recovery.load_state().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_task_and_stop() {
        let (recovery, kv) = tracker();
        let recovery = recovery.with_heartbeat_interval(Duration::from_millis(10));
        write_state(&kv, 1, json!([]));

        let mut handle = recovery.start_heartbeat().unwrap();
        assert!(handle.is_running());
        assert!(!recovery.detect_crash());

        kv.set_item(DEFAULT_RECOVERY_KEY, &json!({"lastActive": 1}).to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recovery.load_state().unwrap().last_active > 1);

        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
        assert!(recovery.load_state().is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(recovery.load_state().is_none());
    }

    /// Holds every read-modify-write back before it reaches the slot.
    struct SlowKv {
        inner: MemoryKv,
        delay: Duration,
    }

    impl KeyValueStore for SlowKv {
        fn get_item(&self, key: &str) -> Result<Option<String>> {
            self.inner.get_item(key)
        }

        fn set_item(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set_item(key, value)
        }

        fn remove_item(&self, key: &str) -> Result<()> {
            self.inner.remove_item(key)
        }

        fn update(
            &self,
            key: &str,
            f: &mut dyn FnMut(Option<String>) -> Option<String>,
        ) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.update(key, f)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_beat_in_flight_at_stop_does_not_revive_state() {
        let kv = MemoryKv::new();
        let slow = SlowKv { inner: kv.clone(), delay: Duration::from_millis(100) };
        let recovery = CrashRecovery::new(Arc::new(slow))
            .with_heartbeat_interval(Duration::from_millis(10));

        let mut handle = recovery.start_heartbeat().unwrap();
        // The first periodic beat is now blocked inside the slow update.
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        assert!(kv.get_item(DEFAULT_RECOVERY_KEY).unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(kv.get_item(DEFAULT_RECOVERY_KEY).unwrap().is_none());
        assert_eq!(recovery.session_state(), SessionState::NoSession);
    }

    struct CountingWorker {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OfflineCacheWorker for CountingWorker {
        async fn register(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState("worker unsupported".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initialize_after_crash() {
        let (recovery, kv) = tracker();
        write_state(
            &kv,
            now_millis() - 10_000,
            json!([{"type": "update", "todoId": "c1", "data": {"completed": true}}]),
        );
        let worker = CountingWorker { calls: AtomicUsize::new(0), fail: true };

        let startup = recovery.initialize_crash_recovery(Some(&worker)).await;

        assert!(startup.has_crashed);
        assert_eq!(startup.pending_operations.len(), 1);
        assert_eq!(startup.pending_operations[0].kind, OperationKind::Update);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.session_state(), SessionState::Active);
        assert!(recovery.get_pending_operations().is_empty());

        recovery.shutdown();
        recovery.shutdown();
        assert_eq!(recovery.session_state(), SessionState::NoSession);
    }

    #[tokio::test]
    async fn test_initialize_clean_start_keeps_log() {
        let (recovery, _) = tracker();
        recovery.add_pending_operation(OperationKind::Create, None, None);

        let startup = recovery.initialize_crash_recovery(None).await;
        assert!(!startup.has_crashed);
        assert!(startup.pending_operations.is_empty());
        assert_eq!(recovery.load_state().unwrap().pending_operations.len(), 1);
        recovery.shutdown();
    }
}
