use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::warn;

use super::{now_millis, Capability, EngineProvider, StorageMetadata, TodoStore};
use crate::error::{Error, Result};
use crate::todo::{now_utc, validate_todo, Todo, TodoPatch, STORAGE_SCHEMA_VERSION};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS todos (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    stored_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_sync INTEGER NOT NULL,
    version INTEGER NOT NULL,
    item_count INTEGER NOT NULL
);

PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

const SELECT_COLUMNS: &str = "SELECT id, title, completed, created_at, updated_at FROM todos";

/// The primary engine: one row per todo, one transaction per operation.
pub struct SqliteTodoStore {
    conn: Mutex<Connection>,
}

impl SqliteTodoStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(INIT_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn metadata(&self) -> Result<Option<StorageMetadata>> {
        let conn = self.conn.lock();
        let meta = conn
            .query_row(
                "SELECT last_sync, version, item_count FROM store_meta WHERE id = 1",
                [],
                |row| {
                    Ok(StorageMetadata {
                        last_sync: row.get::<_, i64>(0)? as u64,
                        version: row.get::<_, i64>(1)? as u32,
                        item_count: row.get::<_, i64>(2)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Corruption(format!("bad timestamp {:?}: {}", raw, e)))
}

type RawRow = (String, String, bool, String, String);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_row(raw: RawRow) -> Result<Todo> {
    let (id, title, completed, created_at, updated_at) = raw;
    let todo = Todo {
        id,
        title,
        completed,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    };
    validate_todo(&todo)?;
    Ok(todo)
}

fn upsert(tx: &Transaction<'_>, todo: &Todo) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO todos (id, title, completed, created_at, updated_at, version, stored_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            todo.id,
            todo.title,
            todo.completed,
            format_ts(&todo.created_at),
            format_ts(&todo.updated_at),
            STORAGE_SCHEMA_VERSION,
            now_millis() as i64,
        ],
    )?;
    Ok(())
}

fn touch_meta(tx: &Transaction<'_>) -> Result<()> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM todos", [], |row| row.get(0))?;
    tx.execute(
        "INSERT OR REPLACE INTO store_meta (id, last_sync, version, item_count) VALUES (1, ?1, ?2, ?3)",
        params![now_millis() as i64, STORAGE_SCHEMA_VERSION, count],
    )?;
    Ok(())
}

impl TodoStore for SqliteTodoStore {
    fn save(&self, todo: &Todo) -> Result<Todo> {
        validate_todo(todo)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert(&tx, todo)?;
        touch_meta(&tx)?;
        tx.commit()?;
        Ok(todo.clone())
    }

    fn get(&self, id: &str) -> Result<Option<Todo>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], read_raw)
            .optional()?;
        match raw.map(decode_row).transpose() {
            Ok(todo) => Ok(todo),
            Err(e) => {
                warn!(id, error = %e, "skipping undecodable row");
                Ok(None)
            }
        }
    }

    fn get_all(&self) -> Result<Vec<Todo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at, id", SELECT_COLUMNS))?;
        let raws = stmt
            .query_map([], read_raw)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut todos = Vec::with_capacity(raws.len());
        for raw in raws {
            let id = raw.0.clone();
            match decode_row(raw) {
                Ok(todo) => todos.push(todo),
                Err(e) => warn!(id = %id, error = %e, "skipping undecodable row"),
            }
        }
        Ok(todos)
    }

    fn update(&self, id: &str, patch: &TodoPatch) -> Result<Option<Todo>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let raw = tx
            .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], read_raw)
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let current = match decode_row(raw) {
            Ok(todo) => todo,
            Err(e) => {
                warn!(id, error = %e, "skipping undecodable row");
                return Ok(None);
            }
        };
        let updated = current.with_patch(patch, now_utc());
        validate_todo(&updated)?;
        upsert(&tx, &updated)?;
        touch_meta(&tx)?;
        tx.commit()?;
        Ok(Some(updated))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM todos WHERE id = ?1", params![id])?;
        touch_meta(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM todos", [])?;
        touch_meta(&tx)?;
        tx.commit()?;
        Ok(())
    }
}

/// Opens a [`SqliteTodoStore`] at a file path, or in memory.
pub struct SqliteProvider {
    path: Option<PathBuf>,
}

impl SqliteProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()) }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }
}

impl EngineProvider for SqliteProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn detect(&self) -> Capability {
        match &self.path {
            None => Capability::Available,
            Some(path) => {
                let parent_ok = path
                    .parent()
                    .map(|p| p.as_os_str().is_empty() || p.is_dir())
                    .unwrap_or(true);
                if parent_ok {
                    Capability::Available
                } else {
                    Capability::Unavailable
                }
            }
        }
    }

    fn open(&self) -> Result<Box<dyn TodoStore>> {
        let store = match &self.path {
            None => SqliteTodoStore::open_in_memory()?,
            Some(path) => SqliteTodoStore::open(&path.to_string_lossy())?,
        };
        Ok(Box::new(store))
    }
}
