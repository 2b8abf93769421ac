use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{Capability, EngineProvider, TodoStore};
use crate::error::Result;
use crate::todo::{Todo, TodoPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Primary,
    Fallback,
}

enum Selection {
    Undecided,
    Primary(Arc<dyn TodoStore>),
    Fallback,
}

/// One storage interface over a primary engine and an always-available
/// fallback. The backend choice is made on first use and kept until
/// [`ResilientStorage::reset`]; a primary failure demotes to the fallback for
/// good.
pub struct ResilientStorage {
    primary: Option<Box<dyn EngineProvider>>,
    fallback: Arc<dyn TodoStore>,
    selection: Mutex<Selection>,
}

impl ResilientStorage {
    pub fn new(primary: Box<dyn EngineProvider>, fallback: Arc<dyn TodoStore>) -> Self {
        Self {
            primary: Some(primary),
            fallback,
            selection: Mutex::new(Selection::Undecided),
        }
    }

    pub fn fallback_only(fallback: Arc<dyn TodoStore>) -> Self {
        Self {
            primary: None,
            fallback,
            selection: Mutex::new(Selection::Undecided),
        }
    }

    pub fn init(&self) -> Backend {
        match self.ensure() {
            Some(_) => Backend::Primary,
            None => Backend::Fallback,
        }
    }

    pub fn active_backend(&self) -> Option<Backend> {
        match &*self.selection.lock() {
            Selection::Undecided => None,
            Selection::Primary(_) => Some(Backend::Primary),
            Selection::Fallback => Some(Backend::Fallback),
        }
    }

    pub fn reset(&self) {
        *self.selection.lock() = Selection::Undecided;
    }

    pub fn fallback(&self) -> &Arc<dyn TodoStore> {
        &self.fallback
    }

    /// Returns the primary store when it is the active backend.
    fn ensure(&self) -> Option<Arc<dyn TodoStore>> {
        let mut selection = self.selection.lock();
        match &*selection {
            Selection::Primary(store) => return Some(Arc::clone(store)),
            Selection::Fallback => return None,
            Selection::Undecided => {}
        }

        let Some(provider) = &self.primary else {
            *selection = Selection::Fallback;
            return None;
        };
        if provider.detect() == Capability::Unavailable {
            info!(engine = provider.name(), "primary engine unavailable, using fallback");
            *selection = Selection::Fallback;
            return None;
        }
        match provider.open() {
            Ok(store) => {
                let store: Arc<dyn TodoStore> = Arc::from(store);
                info!(engine = provider.name(), "primary engine selected");
                *selection = Selection::Primary(Arc::clone(&store));
                Some(store)
            }
            Err(e) => {
                warn!(engine = provider.name(), error = %e, "primary engine failed to open, using fallback");
                *selection = Selection::Fallback;
                None
            }
        }
    }

    fn demote(&self) {
        *self.selection.lock() = Selection::Fallback;
    }

    /// Runs `op` on the primary engine, demoting and retrying on the fallback
    /// when it fails. The flag reports whether the primary served the call.
    fn with_fallback<T>(
        &self,
        op_name: &str,
        op: impl Fn(&dyn TodoStore) -> Result<T>,
    ) -> Result<(T, bool)> {
        let Some(primary) = self.ensure() else {
            return op(self.fallback.as_ref()).map(|v| (v, false));
        };
        match op(primary.as_ref()) {
            Ok(value) => Ok((value, true)),
            Err(e) if e.is_backend_failure() => {
                warn!(op = op_name, error = %e, "primary storage failed, falling back");
                self.demote();
                op(self.fallback.as_ref()).map(|v| (v, false))
            }
            Err(e) => Err(e),
        }
    }

    fn mirror(&self, op_name: &str, op: impl FnOnce(&dyn TodoStore) -> Result<()>) {
        if let Err(e) = op(self.fallback.as_ref()) {
            warn!(op = op_name, error = %e, "failed to mirror write to fallback");
        }
    }
}

impl TodoStore for ResilientStorage {
    fn save(&self, todo: &Todo) -> Result<Todo> {
        let (saved, on_primary) = self.with_fallback("save", |s| s.save(todo))?;
        if on_primary {
            self.mirror("save", |s| s.save(&saved).map(|_| ()));
        }
        Ok(saved)
    }

    fn get(&self, id: &str) -> Result<Option<Todo>> {
        self.with_fallback("get", |s| s.get(id)).map(|(v, _)| v)
    }

    fn get_all(&self) -> Result<Vec<Todo>> {
        self.with_fallback("get_all", |s| s.get_all()).map(|(v, _)| v)
    }

    fn update(&self, id: &str, patch: &TodoPatch) -> Result<Option<Todo>> {
        let (updated, on_primary) = self.with_fallback("update", |s| s.update(id, patch))?;
        if let (Some(todo), true) = (&updated, on_primary) {
            self.mirror("update", |s| s.save(todo).map(|_| ()));
        }
        Ok(updated)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let ((), on_primary) = self.with_fallback("delete", |s| s.delete(id))?;
        if on_primary {
            self.mirror("delete", |s| s.delete(id));
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let ((), on_primary) = self.with_fallback("clear", |s| s.clear())?;
        if on_primary {
            self.mirror("clear", |s| s.clear());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::{KeyValueStore, LocalTodoStore, MemoryKv};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A primary engine whose availability and health are switchable.
    struct FlakyProvider {
        capability: Capability,
        fail_open: bool,
        broken: Arc<AtomicBool>,
        opens: Arc<AtomicUsize>,
        inner: Arc<LocalTodoStore>,
    }

    struct FlakyStore {
        broken: Arc<AtomicBool>,
        inner: Arc<LocalTodoStore>,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                Err(Error::Storage("engine closed".into()))
            } else {
                Ok(())
            }
        }
    }

    impl TodoStore for FlakyStore {
        fn save(&self, todo: &Todo) -> Result<Todo> {
            self.check()?;
            self.inner.save(todo)
        }
        fn get(&self, id: &str) -> Result<Option<Todo>> {
            self.check()?;
            self.inner.get(id)
        }
        fn get_all(&self) -> Result<Vec<Todo>> {
            self.check()?;
            self.inner.get_all()
        }
        fn update(&self, id: &str, patch: &TodoPatch) -> Result<Option<Todo>> {
            self.check()?;
            self.inner.update(id, patch)
        }
        fn delete(&self, id: &str) -> Result<()> {
            self.check()?;
            self.inner.delete(id)
        }
        fn clear(&self) -> Result<()> {
            self.check()?;
            self.inner.clear()
        }
    }

    impl EngineProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn detect(&self) -> Capability {
            self.capability
        }
        fn open(&self) -> Result<Box<dyn TodoStore>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(Error::Storage("open blocked".into()));
            }
            Ok(Box::new(FlakyStore {
                broken: Arc::clone(&self.broken),
                inner: Arc::clone(&self.inner),
            }))
        }
    }

    struct Fixture {
        storage: ResilientStorage,
        primary_data: Arc<LocalTodoStore>,
        fallback: Arc<LocalTodoStore>,
        broken: Arc<AtomicBool>,
        opens: Arc<AtomicUsize>,
    }

    fn fixture(capability: Capability, fail_open: bool) -> Fixture {
        let primary_data = Arc::new(LocalTodoStore::new(Arc::new(MemoryKv::new()), "primary"));
        let fallback = Arc::new(LocalTodoStore::new(Arc::new(MemoryKv::new()), "todos"));
        let broken = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(AtomicUsize::new(0));
        let provider = FlakyProvider {
            capability,
            fail_open,
            broken: Arc::clone(&broken),
            opens: Arc::clone(&opens),
            inner: Arc::clone(&primary_data),
        };
        let storage = ResilientStorage::new(Box::new(provider), fallback.clone());
        Fixture { storage, primary_data, fallback, broken, opens }
    }

    #[test]
    fn test_undetectable_primary_selects_fallback_without_probing() {
        let f = fixture(Capability::Unavailable, false);
        assert_eq!(f.storage.active_backend(), None);

        let todo = Todo::new("local only");
        f.storage.save(&todo).unwrap();
        let all = f.storage.get_all().unwrap();

        assert_eq!(f.storage.active_backend(), Some(Backend::Fallback));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "local only");
        assert_eq!(f.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_open_failure_is_cached() {
        let f = fixture(Capability::Available, true);
        assert_eq!(f.storage.init(), Backend::Fallback);
        f.storage.get_all().unwrap();
        f.storage.get_all().unwrap();
        assert_eq!(f.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_primary_writes_are_mirrored() {
        let f = fixture(Capability::Available, false);
        assert_eq!(f.storage.init(), Backend::Primary);

        let todo = Todo::new("mirrored");
        f.storage.save(&todo).unwrap();
        assert!(f.primary_data.get(&todo.id).unwrap().is_some());
        assert!(f.fallback.get(&todo.id).unwrap().is_some());

        let updated = f.storage.update(&todo.id, &TodoPatch::completed(true)).unwrap().unwrap();
        assert!(f.fallback.get(&todo.id).unwrap().unwrap().completed);
        assert_eq!(updated.id, todo.id);

        f.storage.delete(&todo.id).unwrap();
        assert!(f.fallback.get(&todo.id).unwrap().is_none());
    }

    #[test]
    fn test_primary_failure_demotes_and_retries_on_fallback() {
        let f = fixture(Capability::Available, false);
        let existing = Todo::new("written while healthy");
        f.storage.save(&existing).unwrap();

        f.broken.store(true, Ordering::SeqCst);
        let todo = Todo::new("after failure");
        f.storage.save(&todo).unwrap();

        assert_eq!(f.storage.active_backend(), Some(Backend::Fallback));
        // The mirror kept the fallback current, so nothing is lost.
        let ids: Vec<_> = f.storage.get_all().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![existing.id, todo.id.clone()]);
        assert!(f.primary_data.get(&todo.id).unwrap().is_none());

        // Demotion is permanent even once the engine recovers.
        f.broken.store(false, Ordering::SeqCst);
        f.storage.delete(&todo.id).unwrap();
        assert!(f.primary_data.get(&todo.id).unwrap().is_none());
        assert_eq!(f.storage.active_backend(), Some(Backend::Fallback));
    }

    #[test]
    fn test_validation_errors_do_not_demote() {
        let f = fixture(Capability::Available, false);
        let mut todo = Todo::new("x");
        todo.title.clear();

        assert!(matches!(f.storage.save(&todo), Err(Error::Validation(_))));
        assert_eq!(f.storage.active_backend(), Some(Backend::Primary));
    }

    #[test]
    fn test_reset_probes_again() {
        let f = fixture(Capability::Available, false);
        f.storage.init();
        f.storage.reset();
        assert_eq!(f.storage.active_backend(), None);
        f.storage.init();
        assert_eq!(f.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fallback_only() {
        let kv = MemoryKv::new();
        let storage = ResilientStorage::fallback_only(Arc::new(LocalTodoStore::new(
            Arc::new(kv.clone()),
            "todos",
        )));
        assert_eq!(storage.init(), Backend::Fallback);
        storage.save(&Todo::new("x")).unwrap();
        assert!(kv.get_item("todos").unwrap().is_some());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_primary_with_local_fallback() {
        use crate::storage::SqliteProvider;

        let kv = MemoryKv::new();
        let fallback = Arc::new(LocalTodoStore::new(Arc::new(kv), "todos"));
        let storage = ResilientStorage::new(Box::new(SqliteProvider::in_memory()), fallback.clone());

        let todo = Todo::new("sqlite first");
        storage.save(&todo).unwrap();
        assert_eq!(storage.active_backend(), Some(Backend::Primary));
        assert_eq!(storage.get(&todo.id).unwrap().unwrap().title, "sqlite first");
        assert_eq!(fallback.get(&todo.id).unwrap().unwrap().title, "sqlite first");
    }
}
