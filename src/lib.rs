//! todo-offline: an offline-first task list client.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use sync_engine::{
//!     BroadcastHub, KeyValueStore, LocalTodoStore, MemoryKv, MemoryRemote, ResilienceConfig,
//!     SyncEnvironment, TodoStore,
//! };
//! use todo_offline::{Tab, TabOptions};
//!
//! # async fn run() -> sync_engine::Result<()> {
//! let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
//! let store: Arc<dyn TodoStore> = Arc::new(LocalTodoStore::new(kv.clone(), "todos"));
//! let env = SyncEnvironment::with_broadcast(BroadcastHub::new(), kv.clone());
//!
//! let options = TabOptions {
//!     source: sync_engine::create_source_id(),
//!     store,
//!     recovery_store: kv,
//!     worker: None,
//! };
//! let tab = Tab::open(&ResilienceConfig::default(), &env, MemoryRemote::new(), options).await?;
//! tab.todos().create_todo("Water the plants").await;
//! tab.flush_outbox().await;
//! tab.close();
//! # Ok(())
//! # }
//! ```

mod tab;

pub use tab::{Tab, TabOptions};
