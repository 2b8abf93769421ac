use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::merge::resolve_conflict;
use crate::recovery::{CrashRecovery, OperationKind, PendingOperation};
use crate::remote::RemoteTodos;
use crate::storage::{generate_id, TodoStore};
use crate::sync::{SyncAction, SyncMessage, SyncOutbox};
use crate::todo::{now_utc, validate_title, Todo, TodoPatch};

/// One edit of the in-memory list.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert { index: usize, todo: Todo },
    Replace { id: String, todo: Todo },
    Remove { id: String },
}

impl Change {
    /// Returns whether the list changed.
    fn apply(&self, items: &mut Vec<Todo>) -> bool {
        match self {
            Change::Insert { index, todo } => {
                items.retain(|t| t.id != todo.id);
                let index = (*index).min(items.len());
                items.insert(index, todo.clone());
                true
            }
            Change::Replace { id, todo } => match items.iter_mut().find(|t| &t.id == id) {
                Some(slot) => {
                    *slot = todo.clone();
                    true
                }
                None => false,
            },
            Change::Remove { id } => {
                let before = items.len();
                items.retain(|t| &t.id != id);
                items.len() != before
            }
        }
    }

    fn persist(&self, store: &dyn TodoStore) -> Result<()> {
        match self {
            Change::Insert { todo, .. } => store.save(todo).map(|_| ()),
            Change::Replace { id, todo } => {
                if id != &todo.id {
                    store.delete(id)?;
                }
                store.save(todo).map(|_| ())
            }
            Change::Remove { id } => store.delete(id),
        }
    }
}

/// An optimistic edit and the change that undoes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub forward: Change,
    pub inverse: Change,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState {
    pub items: Vec<Todo>,
    pub loading: bool,
    pub error: Option<String>,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self { items: Vec::new(), loading: true, error: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
}

/// The todo list a tab works with.
///
/// Every mutation is applied to memory and the local store before the remote
/// call, then either reconciled with the server's record or undone. Failures
/// never surface as `Err`; they land in [`CollectionState::error`].
pub struct TodoCollection<R: RemoteTodos> {
    remote: R,
    store: Arc<dyn TodoStore>,
    state: Mutex<CollectionState>,
    recovery: Option<Arc<CrashRecovery>>,
    outbox: Option<(Arc<SyncOutbox>, String)>,
}

impl<R: RemoteTodos> TodoCollection<R> {
    pub fn new(remote: R, store: Arc<dyn TodoStore>) -> Self {
        Self {
            remote,
            store,
            state: Mutex::new(CollectionState::default()),
            recovery: None,
            outbox: None,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<CrashRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Confirmed mutations are announced on `outbox` as coming from `source`.
    pub fn with_outbox(mut self, outbox: Arc<SyncOutbox>, source: impl Into<String>) -> Self {
        self.outbox = Some((outbox, source.into()));
        self
    }

    pub fn snapshot(&self) -> CollectionState {
        self.state.lock().clone()
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn store(&self) -> &Arc<dyn TodoStore> {
        &self.store
    }

    fn set_error(&self, error: Option<String>) {
        self.state.lock().error = error;
    }

    fn apply_local(&self, change: &Change) -> bool {
        let changed = change.apply(&mut self.state.lock().items);
        if changed || matches!(change, Change::Remove { .. }) {
            if let Err(e) = change.persist(self.store.as_ref()) {
                warn!(error = %e, "failed to mirror change into local store");
            }
        }
        changed
    }

    fn record_pending(&self, kind: OperationKind, todo_id: &str, data: Option<serde_json::Value>) {
        if let Some(recovery) = &self.recovery {
            recovery.add_pending_operation(kind, Some(todo_id), data);
        }
    }

    fn settle(&self, kind: OperationKind, todo_id: &str) {
        if let Some(recovery) = &self.recovery {
            recovery.settle_operation(kind, todo_id);
        }
    }

    fn announce(&self, build: impl FnOnce(&str) -> Result<SyncMessage>) {
        let Some((outbox, source)) = &self.outbox else {
            return;
        };
        match build(source) {
            Ok(message) => {
                outbox.enqueue(message);
            }
            Err(e) => warn!(error = %e, "failed to build sync message"),
        }
    }

    /// Runs `mutation` optimistically around `call`. On failure the inverse
    /// is applied and the error recorded.
    async fn run_mutation<T, Fut>(&self, mutation: Mutation, call: Fut) -> Option<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.apply_local(&mutation.forward);
        match call.await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "remote rejected mutation, rolling back");
                self.apply_local(&mutation.inverse);
                self.set_error(Some(e.to_string()));
                None
            }
        }
    }

    /// Loads cached items when the list is empty, then replaces everything
    /// with the remote listing. A failed listing keeps what is cached.
    pub async fn fetch_todos(&self) {
        {
            let mut state = self.state.lock();
            state.loading = true;
            state.error = None;
        }

        let needs_cache = self.state.lock().items.is_empty();
        if needs_cache {
            match self.store.get_all() {
                Ok(mut cached) => {
                    cached.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    self.state.lock().items = cached;
                }
                Err(e) => warn!(error = %e, "failed to read cached todos"),
            }
        }

        match self.remote.list().await {
            Ok(todos) => {
                self.state.lock().items = todos.clone();
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "failed to clear local store");
                }
                for todo in &todos {
                    if let Err(e) = self.store.save(todo) {
                        warn!(id = %todo.id, error = %e, "failed to cache todo");
                    }
                }
                debug!(count = todos.len(), "fetched todos");
            }
            Err(e) => {
                warn!(error = %e, "fetch failed, keeping cached todos");
                self.set_error(Some(format!("Failed to fetch todos: {}", e)));
            }
        }
        self.state.lock().loading = false;
    }

    pub async fn create_todo(&self, title: &str) -> Option<Todo> {
        let title = title.trim();
        if let Err(e) = validate_title(title) {
            self.set_error(Some(e.to_string()));
            return None;
        }
        self.set_error(None);

        let now = now_utc();
        let temp = Todo {
            id: generate_id(),
            title: title.to_string(),
            completed: false,
            created_at: now,
            updated_at: now,
        };
        let mutation = Mutation {
            forward: Change::Insert { index: 0, todo: temp.clone() },
            inverse: Change::Remove { id: temp.id.clone() },
        };
        self.record_pending(OperationKind::Create, &temp.id, Some(json!({ "title": title })));

        let created = self.run_mutation(mutation, self.remote.create(title)).await;
        self.settle(OperationKind::Create, &temp.id);
        let created = created?;

        self.apply_local(&Change::Replace { id: temp.id.clone(), todo: created.clone() });
        self.announce(|source| SyncMessage::for_todo(SyncAction::Created, &created, source));
        Some(created)
    }

    pub async fn update_todo(&self, id: &str, patch: TodoPatch) -> Option<Todo> {
        let mut patch = patch;
        if let Some(title) = patch.title.take() {
            let title = title.trim().to_string();
            if let Err(e) = validate_title(&title) {
                self.set_error(Some(e.to_string()));
                return None;
            }
            patch.title = Some(title);
        }

        let current = self.state.lock().items.iter().find(|t| t.id == id).cloned();
        let Some(current) = current else {
            self.set_error(Some(Error::NotFound { id: id.to_string() }.to_string()));
            return None;
        };
        self.set_error(None);

        let mutation = Mutation {
            forward: Change::Replace { id: id.to_string(), todo: current.with_patch(&patch, now_utc()) },
            inverse: Change::Replace { id: id.to_string(), todo: current },
        };
        self.record_pending(OperationKind::Update, id, serde_json::to_value(&patch).ok());

        let updated = self.run_mutation(mutation, self.remote.update(id, &patch)).await;
        self.settle(OperationKind::Update, id);
        let updated = updated?;

        self.apply_local(&Change::Replace { id: id.to_string(), todo: updated.clone() });
        self.announce(|source| SyncMessage::for_todo(SyncAction::Updated, &updated, source));
        Some(updated)
    }

    pub async fn delete_todo(&self, id: &str) -> bool {
        let found = {
            let state = self.state.lock();
            state.items.iter().position(|t| t.id == id).map(|i| (i, state.items[i].clone()))
        };
        let Some((index, current)) = found else {
            self.set_error(Some(Error::NotFound { id: id.to_string() }.to_string()));
            return false;
        };
        self.set_error(None);

        let mutation = Mutation {
            forward: Change::Remove { id: id.to_string() },
            inverse: Change::Insert { index, todo: current },
        };
        self.record_pending(OperationKind::Delete, id, None);

        let deleted = self.run_mutation(mutation, self.remote.delete(id)).await;
        self.settle(OperationKind::Delete, id);
        if deleted.is_none() {
            return false;
        }

        self.announce(|source| Ok(SyncMessage::deleted(id, source)));
        true
    }

    /// Applies another tab's notice. Returns whether the list changed.
    pub fn apply_sync_message(&self, message: &SyncMessage) -> Result<bool> {
        let change = match message.action {
            SyncAction::Created | SyncAction::Updated => {
                let incoming = message.todo()?;
                let state = self.state.lock();
                match state.items.iter().position(|t| t.id == incoming.id) {
                    Some(i) => {
                        let local = &state.items[i];
                        if resolve_conflict(local, &incoming) == local {
                            debug!(id = %incoming.id, "local copy kept");
                            return Ok(false);
                        }
                        Change::Replace { id: incoming.id.clone(), todo: incoming }
                    }
                    None => Change::Insert { index: 0, todo: incoming },
                }
            }
            SyncAction::Deleted => {
                let id = message
                    .todo_id()
                    .ok_or_else(|| Error::Validation("deleted message without id".into()))?;
                Change::Remove { id: id.to_string() }
            }
            SyncAction::SyncRequest => return Ok(false),
        };
        Ok(self.apply_local(&change))
    }

    /// Re-issues operations left over from a crashed session, then refetches.
    pub async fn replay_pending(&self, ops: Vec<PendingOperation>) -> ReplayReport {
        let mut report = ReplayReport::default();
        for op in ops {
            match self.replay_one(&op).await {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    warn!(kind = ?op.kind, todo_id = ?op.todo_id, error = %e, "failed to replay operation");
                    report.failed += 1;
                }
            }
        }
        info!(replayed = report.replayed, failed = report.failed, "replayed pending operations");
        self.fetch_todos().await;
        report
    }

    async fn replay_one(&self, op: &PendingOperation) -> Result<()> {
        let todo_id = || {
            op.todo_id
                .as_deref()
                .ok_or_else(|| Error::Validation("pending operation without todo id".into()))
        };
        match op.kind {
            OperationKind::Create => {
                let title = op
                    .data
                    .as_ref()
                    .and_then(|d| d.get("title"))
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| Error::Validation("pending create without title".into()))?;
                self.remote.create(title).await.map(|_| ())
            }
            OperationKind::Update => {
                let patch: TodoPatch = match &op.data {
                    Some(data) => serde_json::from_value(data.clone())?,
                    None => TodoPatch::default(),
                };
                self.remote.update(todo_id()?, &patch).await.map(|_| ())
            }
            OperationKind::Delete => match self.remote.delete(todo_id()?).await {
                Err(Error::Remote { status: Some(404), .. }) => Ok(()),
                other => other,
            },
        }
    }
}
