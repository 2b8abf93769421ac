//! Two tabs of the same origin sharing storage, a remote and a sync channel.
//!
//! Pass a JSON config path as the first argument to override the defaults.
//! With `remoteBaseUrl` set, a single tab lists the todos of that server.
//! Set `RUST_LOG=debug` to watch storage and sync decisions.

use std::sync::Arc;
use std::time::Duration;

use sync_engine::{
    create_source_id, BroadcastHub, HttpRemote, KeyValueStore, LocalTodoStore, MemoryKv,
    MemoryRemote, RemoteTodos, ResilienceConfig, ResilientStorage, SqliteProvider,
    SyncEnvironment, TodoPatch, TodoStore,
};
use todo_offline::{Tab, TabOptions};
use tracing_subscriber::EnvFilter;

fn load_config() -> sync_engine::Result<ResilienceConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => ResilienceConfig::from_json_file(path)?,
        None => ResilienceConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn print_tab<R: RemoteTodos + 'static>(tab: &Tab<R>) {
    let state = tab.todos().snapshot();
    println!("[{}] {} item(s), via {}", tab.source(), state.items.len(), tab.transport().as_str());
    for todo in &state.items {
        println!("    [{}] {}", if todo.completed { "x" } else { " " }, todo.title);
    }
    if let Some(error) = &state.error {
        println!("    error: {}", error);
    }
    if let Ok(status) = serde_json::to_string(&tab.sync_status()) {
        println!("    sync: {}", status);
    }
}

#[tokio::main]
async fn main() -> sync_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let fallback: Arc<dyn TodoStore> = Arc::new(LocalTodoStore::new(kv.clone(), &config.storage_key));
    let primary = match &config.sqlite_path {
        Some(path) => SqliteProvider::new(path),
        None => SqliteProvider::in_memory(),
    };
    let store: Arc<dyn TodoStore> = Arc::new(ResilientStorage::new(Box::new(primary), fallback));
    let env = SyncEnvironment::with_broadcast(BroadcastHub::new(), kv.clone())
        .sync_key(config.sync_key.clone());
    let open = |source: String| TabOptions {
        source,
        store: store.clone(),
        recovery_store: kv.clone(),
        worker: None,
    };

    if let Some(url) = &config.remote_base_url {
        println!("== listing {}", url);
        let tab = Tab::open(&config, &env, HttpRemote::new(url.as_str()), open(create_source_id())).await?;
        print_tab(&tab);
        tab.close();
        return Ok(());
    }

    let remote = Arc::new(MemoryRemote::new());
    let tab_a = Tab::open(&config, &env, remote.clone(), open(create_source_id())).await?;
    let tab_b = Tab::open(&config, &env, remote.clone(), open(create_source_id())).await?;

    println!("== tab A adds two todos");
    let milk = tab_a.todos().create_todo("Buy milk").await;
    tab_a.todos().create_todo("Call the plumber").await;
    tab_a.flush_outbox().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_tab(&tab_a);
    print_tab(&tab_b);

    println!("== tab B completes one");
    if let Some(milk) = &milk {
        tab_b.todos().update_todo(&milk.id, TodoPatch::completed(true)).await;
        tab_b.flush_outbox().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_tab(&tab_a);

    println!("== the remote goes away; tab A's edit is rolled back");
    remote.set_online(false);
    if let Some(milk) = &milk {
        tab_a.todos().update_todo(&milk.id, TodoPatch::title("Buy oat milk")).await;
    }
    print_tab(&tab_a);
    remote.set_online(true);

    tab_a.close();
    tab_b.close();
    Ok(())
}
