//! The WebSocket sync broker server (§4.6): accepts connections, routes by
//! path to a [`Room`], and runs each client's receive loop.
//!
//! This crate only knows how to be an axum application; the binary in
//! `main.rs` wires it to a listener, tracing, and shutdown signal handling.

pub mod client;
pub mod config;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use syncboard_room::{RoomConfig, RoomRegistry};
use syncboard_store::{FileYStore, SqliteYStore, UpdateStore};
use tracing::info;

pub use config::Config;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the room registry and, if `config` names a persistence
    /// backend, the store factory that attaches to every newly-created
    /// room. `database_url` takes priority over `store_dir` (§6).
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let room_config = RoomConfig { awareness_ttl: config.awareness_ttl(), broadcast_capacity: config.client_send_queue_capacity };

        let factory = if let Some(database_url) = &config.database_url {
            // `connect_lazy` validates the DSN but defers the actual
            // connection to first use, so this stays synchronous.
            let pool = SqlitePoolOptions::new().connect_lazy(database_url)?;
            Some(db_store_factory(pool))
        } else {
            config.store_dir.clone().map(file_store_factory)
        };

        let rooms = Arc::new(RoomRegistry::with_config(factory, room_config));
        Ok(Self { rooms, config })
    }
}

/// Build a [`syncboard_room::StoreFactory`] that opens one [`FileYStore`]
/// per room path under `dir`, named after the path with `/` swapped for
/// `_` so nested document paths don't try to create subdirectories.
fn file_store_factory(dir: String) -> syncboard_room::StoreFactory {
    Arc::new(move |path: &str| {
        let dir = dir.clone();
        let file_name = path.replace('/', "_");
        Box::pin(async move {
            let mut file_path = PathBuf::from(dir);
            file_path.push(file_name);
            let store = FileYStore::open(file_path).await?;
            Ok(Some(Arc::new(store) as Arc<dyn UpdateStore>))
        }) as Pin<Box<dyn Future<Output = syncboard_common::Result<Option<Arc<dyn UpdateStore>>>> + Send>>
    })
}

/// Build a [`syncboard_room::StoreFactory`] that opens one [`SqliteYStore`]
/// per room, keyed by path, against a single shared pool.
fn db_store_factory(pool: SqlitePool) -> syncboard_room::StoreFactory {
    Arc::new(move |path: &str| {
        let pool = pool.clone();
        let room = path.to_string();
        Box::pin(async move {
            let store = SqliteYStore::open(pool, room).await?;
            Ok(Some(Arc::new(store) as Arc<dyn UpdateStore>))
        }) as Pin<Box<dyn Future<Output = syncboard_common::Result<Option<Arc<dyn UpdateStore>>>> + Send>>
    })
}

/// The broker's axum router: a health check plus one catch-all WebSocket
/// route, `/:room`, whose path segment is the room key.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/{*room}", get(ws_upgrade))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "syncboard" }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, Path(room): Path<String>, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        match state.rooms.get_or_create(&room).await {
            Ok(room_handle) => client::handle_connection(socket, room, room_handle).await,
            Err(e) => tracing::error!(room = %room, error = %e, "failed to open room"),
        }
    })
}

/// Periodically expire stale awareness entries across every live room.
/// Meant to be spawned once at server startup and left running for the
/// process's lifetime; it has no exit condition of its own.
pub async fn run_awareness_ticker(state: AppState, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        for room in state.rooms.rooms() {
            room.expire_awareness();
        }
    }
}

/// Close every live room's store with a bounded grace period. Called from
/// the shutdown signal handler; never panics even if a store is already
/// detached or a close call hangs past `grace`.
pub async fn shutdown(state: &AppState, grace: Duration) {
    info!(rooms = state.rooms.len(), "shutting down, draining rooms");
    let closes: Vec<_> = state
        .rooms
        .rooms()
        .into_iter()
        .map(|room| async move { room.squash().await })
        .collect();
    let _ = tokio::time::timeout(grace, futures_util::future::join_all(closes)).await;
}
