use std::sync::Arc;

use sync_engine::{
    ApplyFn, CrashRecovery, KeyValueStore, OfflineCacheWorker, RecoveryStartup, RemoteTodos,
    ReplayReport, ResilienceConfig, Result, SyncEnvironment, SyncManagerOptions, SyncMessage,
    SyncOutbox, SyncProvider, SyncSnapshot, TodoCollection, TodoStore, TransportMode,
};
use tracing::{info, warn};

/// One open tab: its todo list, crash tracking, outbox and sync endpoint.
pub struct Tab<R: RemoteTodos + 'static> {
    source: String,
    collection: Arc<TodoCollection<R>>,
    outbox: Arc<SyncOutbox>,
    recovery: Arc<CrashRecovery>,
    provider: SyncProvider,
    startup: RecoveryStartup,
}

pub struct TabOptions<'a> {
    pub source: String,
    pub store: Arc<dyn TodoStore>,
    pub recovery_store: Arc<dyn KeyValueStore>,
    pub worker: Option<&'a dyn OfflineCacheWorker>,
}

impl<R: RemoteTodos + 'static> Tab<R> {
    /// Recovers from a crashed session if needed, loads the list and starts
    /// listening to the other tabs.
    pub async fn open(
        config: &ResilienceConfig,
        env: &SyncEnvironment,
        remote: R,
        options: TabOptions<'_>,
    ) -> Result<Self> {
        config.validate()?;
        let TabOptions { source, store, recovery_store, worker } = options;

        let recovery = Arc::new(CrashRecovery::from_config(recovery_store, config));
        let outbox = Arc::new(SyncOutbox::new(config.outbox_capacity));
        let collection = Arc::new(
            TodoCollection::new(remote, store)
                .with_recovery(recovery.clone())
                .with_outbox(outbox.clone(), source.clone()),
        );

        let startup = recovery.initialize_crash_recovery(worker).await;
        if startup.has_crashed && !startup.pending_operations.is_empty() {
            let ReplayReport { replayed, failed } =
                collection.replay_pending(startup.pending_operations.clone()).await;
            info!(%source, replayed, failed, "recovered pending operations");
        } else {
            collection.fetch_todos().await;
        }

        let target = collection.clone();
        let apply: ApplyFn =
            Arc::new(move |message: &SyncMessage| target.apply_sync_message(message).map(|_| ()));
        let sync_options = SyncManagerOptions::new(source.clone(), Arc::new(|_| {}))
            .channel_name(config.channel_name.clone())
            .poll_interval(config.poll_interval());
        let provider = SyncProvider::start(env, sync_options, apply);

        info!(%source, mode = provider.manager().mode().as_str(), "tab opened");
        Ok(Self { source, collection, outbox, recovery, provider, startup })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn todos(&self) -> &TodoCollection<R> {
        &self.collection
    }

    pub fn startup(&self) -> &RecoveryStartup {
        &self.startup
    }

    pub fn transport(&self) -> TransportMode {
        self.provider.manager().mode()
    }

    pub fn sync_status(&self) -> SyncSnapshot {
        self.provider.status()
    }

    pub fn outbox(&self) -> &SyncOutbox {
        &self.outbox
    }

    /// Sends queued notices to the other tabs. Returns how many went out.
    pub async fn flush_outbox(&self) -> usize {
        let provider = &self.provider;
        self.outbox
            .flush(|message| {
                let sent = provider.broadcast(&message);
                async move { sent }
            })
            .await
            .len()
    }

    /// Clean shutdown: stops syncing and clears the crash marker.
    pub fn close(self) {
        self.provider.close();
        self.recovery.shutdown();
        if self.outbox.is_pending() {
            warn!(source = %self.source, pending = self.outbox.len(), "closing with unsent notices");
        }
        info!(source = %self.source, "tab closed");
    }
}
