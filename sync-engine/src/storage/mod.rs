mod facade;
mod file;
mod local;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use facade::{Backend, ResilientStorage};
pub use file::FileKv;
pub use local::{LocalTodoStore, StorageKeys, StorageMetadata};
pub use memory::MemoryKv;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteProvider, SqliteTodoStore};

use rand::Rng;

use crate::error::Result;
use crate::todo::{Todo, TodoPatch};

/// The durable-store contract shared by the primary and fallback engines.
pub trait TodoStore: Send + Sync {
    fn save(&self, todo: &Todo) -> Result<Todo>;
    fn get(&self, id: &str) -> Result<Option<Todo>>;
    fn get_all(&self) -> Result<Vec<Todo>>;
    fn update(&self, id: &str, patch: &TodoPatch) -> Result<Option<Todo>>;
    fn delete(&self, id: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// String slots addressed by key, the shape of browser local storage.
///
/// Shared between tabs, so read-modify-write sequences go through `update`.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;

    /// Replaces the slot with `f(current)`; `None` removes it. Implementations
    /// hold their lock across the whole call.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Option<String>,
    ) -> Result<()> {
        match f(self.get_item(key)?) {
            Some(value) => self.set_item(key, &value),
            None => self.remove_item(key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable,
}

impl Capability {
    pub fn is_available(self) -> bool {
        self == Capability::Available
    }
}

/// Opens the higher-capability primary engine.
pub trait EngineProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self) -> Capability;
    fn open(&self) -> Result<Box<dyn TodoStore>>;
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Collision-resistant lowercase id: `c`, the base36 clock, then random
/// characters. Used for temporary ids as well as store-assigned ones.
pub fn generate_id() -> String {
    format!("c{}{}", to_base36(now_millis()), random_suffix(12))
}
