//! The authoritative todo service, seen from the client.
//!
//! [`HttpRemote`] speaks the REST contract (`GET/POST /todos`,
//! `PATCH/DELETE /todos/{id}`); [`MemoryRemote`] applies the same
//! validation and status rules in process.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::todo::{now_utc, validate_title, Todo, TodoPatch};

#[async_trait]
pub trait RemoteTodos: Send + Sync {
    async fn list(&self) -> Result<Vec<Todo>>;
    async fn create(&self, title: &str) -> Result<Todo>;
    async fn update(&self, id: &str, patch: &TodoPatch) -> Result<Todo>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteTodos + ?Sized> RemoteTodos for std::sync::Arc<T> {
    async fn list(&self) -> Result<Vec<Todo>> {
        (**self).list().await
    }

    async fn create(&self, title: &str) -> Result<Todo> {
        (**self).create(title).await
    }

    async fn update(&self, id: &str, patch: &TodoPatch) -> Result<Todo> {
        (**self).update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id).await
    }
}

fn validation_failed() -> Error {
    Error::remote(Some(400), "Validation failed")
}

fn not_found() -> Error {
    Error::remote(Some(404), "Todo not found")
}

/// In-process service. Newest first, like the real listing.
#[derive(Default)]
pub struct MemoryRemote {
    todos: Mutex<Vec<Todo>>,
    offline: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_todos(todos: Vec<Todo>) -> Self {
        let remote = Self::new();
        *remote.todos.lock() = todos;
        remote
    }

    /// While offline every call fails without touching the data.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn todos(&self) -> Vec<Todo> {
        self.todos.lock().clone()
    }

    fn reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::remote(None, "network unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTodos for MemoryRemote {
    async fn list(&self) -> Result<Vec<Todo>> {
        self.reachable()?;
        let mut todos = self.todos.lock().clone();
        todos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(todos)
    }

    async fn create(&self, title: &str) -> Result<Todo> {
        self.reachable()?;
        validate_title(title).map_err(|_| validation_failed())?;
        let todo = Todo::new(title.trim());
        self.todos.lock().push(todo.clone());
        Ok(todo)
    }

    async fn update(&self, id: &str, patch: &TodoPatch) -> Result<Todo> {
        self.reachable()?;
        if let Some(title) = &patch.title {
            validate_title(title).map_err(|_| validation_failed())?;
        }
        let mut todos = self.todos.lock();
        let todo = todos.iter_mut().find(|t| t.id == id).ok_or_else(not_found)?;
        *todo = todo.with_patch(patch, now_utc());
        Ok(todo.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.reachable()?;
        let mut todos = self.todos.lock();
        let before = todos.len();
        todos.retain(|t| t.id != id);
        if todos.len() == before {
            return Err(not_found());
        }
        Ok(())
    }
}

#[cfg(feature = "http")]
pub use http::HttpRemote;

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use reqwest::{Client, Response};
    use serde_json::{json, Value};
    use tracing::debug;

    use super::RemoteTodos;
    use crate::error::{Error, Result};
    use crate::todo::{decode_record, decode_records, Todo, TodoPatch};

    pub struct HttpRemote {
        client: Client,
        base_url: String,
    }

    impl HttpRemote {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self::with_client(Client::new(), base_url)
        }

        pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
            let base_url = base_url.into().trim_end_matches('/').to_string();
            Self { client, base_url }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }

        /// Non-2xx responses fail with the body's `error` field, falling back
        /// to the status reason phrase.
        async fn check(response: Response) -> Result<Response> {
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let reason = status.canonical_reason().unwrap_or("Request failed").to_string();
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(reason);
            debug!(status = status.as_u16(), %message, "remote call failed");
            Err(Error::remote(Some(status.as_u16()), message))
        }

        async fn todo_from(response: Response) -> Result<Todo> {
            let body: Value = Self::check(response).await?.json().await?;
            Ok(decode_record(&body)?.into_todo())
        }
    }

    #[async_trait]
    impl RemoteTodos for HttpRemote {
        async fn list(&self) -> Result<Vec<Todo>> {
            let response = self.client.get(self.url("/todos")).send().await?;
            let body: Value = Self::check(response).await?.json().await?;
            Ok(decode_records(&body)?.into_iter().map(|r| r.into_todo()).collect())
        }

        async fn create(&self, title: &str) -> Result<Todo> {
            let response = self
                .client
                .post(self.url("/todos"))
                .json(&json!({ "title": title }))
                .send()
                .await?;
            Self::todo_from(response).await
        }

        async fn update(&self, id: &str, patch: &TodoPatch) -> Result<Todo> {
            let response = self
                .client
                .patch(self.url(&format!("/todos/{}", id)))
                .json(patch)
                .send()
                .await?;
            Self::todo_from(response).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            let response =
                self.client.delete(self.url(&format!("/todos/{}", id))).send().await?;
            Self::check(response).await?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_base_url_is_normalized() {
            let remote = HttpRemote::new("http://localhost:3000/api/");
            assert_eq!(remote.url("/todos"), "http://localhost:3000/api/todos");
        }

        #[tokio::test]
        async fn test_unreachable_server_is_a_remote_error() {
            let remote = HttpRemote::new("http://127.0.0.1:9");
            let err = remote.list().await.unwrap_err();
            assert!(matches!(err, Error::Remote { .. }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_remote_contract() {
        let remote = MemoryRemote::new();
        let first = remote.create("first").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = remote.create("  second  ").await.unwrap();
        assert_eq!(second.title, "second");

        let listed = remote.list().await.unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        let done = remote.update(&first.id, &TodoPatch::completed(true)).await.unwrap();
        assert!(done.completed);
        assert!(done.updated_at >= first.updated_at);

        remote.delete(&first.id).await.unwrap();
        assert_eq!(remote.todos().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_remote_errors() {
        let remote = MemoryRemote::new();
        let err = remote.create("   ").await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: Some(400), .. }));
        assert_eq!(err.to_string(), "Validation failed");

        let err = remote.update("missing", &TodoPatch::title("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "Todo not found");
        assert!(matches!(remote.delete("missing").await, Err(Error::Remote { status: Some(404), .. })));

        remote.set_online(false);
        assert!(remote.list().await.is_err());
        assert!(remote.create("x").await.is_err());
        assert!(remote.todos().is_empty());
        remote.set_online(true);
        assert!(remote.list().await.unwrap().is_empty());
    }
}
