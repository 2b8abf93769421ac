mod collection;
mod config;
mod error;
mod merge;
mod recovery;
mod remote;
mod storage;
mod sync;
mod todo;

pub use collection::{Change, CollectionState, Mutation, ReplayReport, TodoCollection};
pub use config::ResilienceConfig;
pub use error::{Error, Result};
pub use merge::{decide, resolve_conflict, MergeDecision, TieBreakPolicy};
pub use recovery::{
    CrashRecovery, HeartbeatHandle, OfflineCacheWorker, OperationKind, PendingOperation,
    RecoveryStartup, RecoveryState, SessionState,
};
#[cfg(feature = "http")]
pub use remote::HttpRemote;
pub use remote::{MemoryRemote, RemoteTodos};
#[cfg(feature = "sqlite")]
pub use storage::{SqliteProvider, SqliteTodoStore};
pub use storage::{
    generate_id, now_millis, Backend, Capability, EngineProvider, FileKv, KeyValueStore,
    LocalTodoStore, MemoryKv, ResilientStorage, StorageKeys, StorageMetadata, TodoStore,
};
pub use sync::{
    create_source_id, detect_broadcast, ApplyFn, BroadcastChannel, BroadcastHub, MessageHandler,
    PollingQueue, QueuedMessage, Resource, Subscription, SyncAction, SyncEnvironment, SyncManager,
    SyncManagerOptions, SyncMessage, SyncOutbox, SyncProvider, SyncSnapshot, SyncStatus,
    TransportMode,
};
pub use todo::{
    decode_record, decode_records, now_utc, validate_title, validate_todo, StoredTodoRecord, Todo,
    TodoPatch, MAX_TITLE_CHARS, STORAGE_SCHEMA_VERSION,
};

pub mod defaults {
    pub use crate::config::{
        DEFAULT_CHANNEL, DEFAULT_CRASH_THRESHOLD_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
        DEFAULT_OUTBOX_CAPACITY, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RECOVERY_KEY,
        DEFAULT_STORAGE_KEY, DEFAULT_SYNC_KEY,
    };
}
