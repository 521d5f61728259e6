//! Owns one `Room` per document path and creates them lazily (§4.5, §4.6).
//!
//! Rooms are never garbage-collected once created — late-rejoining clients
//! must still see full history, which the spec calls out as a deliberate
//! choice rather than an oversight (see the open question in the design
//! notes). A room that was created with a store stays attached to it for
//! its lifetime, unless persistence itself faults (see [`Room::persist`]).

mod room;

pub use room::{Broadcast, Room, RoomConfig};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use syncboard_common::Result;
use syncboard_store::UpdateStore;
use tokio::sync::Mutex as AsyncMutex;

/// Builds a store for a newly-created room, or returns `None` to leave that
/// room unpersisted. Boxed so the registry doesn't need to be generic over
/// the backend (file, sqlite, or none) a deployment chooses.
pub type StoreFactory =
    Arc<dyn Fn(&str) -> Pin<Box<dyn Future<Output = Result<Option<Arc<dyn UpdateStore>>>> + Send>> + Send + Sync>;

/// The server's path → room map.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    store_factory: Option<StoreFactory>,
    room_config: RoomConfig,
    /// Serializes room creation so two clients racing to open the same new
    /// path don't each build a store and replay history independently.
    creation_lock: AsyncMutex<()>,
}

impl RoomRegistry {
    pub fn new(store_factory: Option<StoreFactory>) -> Self {
        Self::with_config(store_factory, RoomConfig::default())
    }

    pub fn with_config(store_factory: Option<StoreFactory>, room_config: RoomConfig) -> Self {
        Self { rooms: DashMap::new(), store_factory, room_config, creation_lock: AsyncMutex::new(()) }
    }

    /// Look up the room for `path`, creating it (and its store, if a
    /// factory is configured) if this is the first connection to ever name
    /// it.
    pub async fn get_or_create(&self, path: &str) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.get(path) {
            return Ok(room.clone());
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(room) = self.rooms.get(path) {
            return Ok(room.clone());
        }

        let store = match &self.store_factory {
            Some(factory) => factory(path).await?,
            None => None,
        };
        let room = Room::open_with_config(path.to_string(), store, self.room_config).await?;
        self.rooms.insert(path.to_string(), room.clone());
        Ok(room)
    }

    pub fn get(&self, path: &str) -> Option<Arc<Room>> {
        self.rooms.get(path).map(|r| r.clone())
    }

    /// Every live room, for the periodic awareness-expiry tick and for
    /// server shutdown.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_path_returns_the_same_room() {
        let registry = RoomRegistry::default();
        let a = registry.get_or_create("room-1").await.unwrap();
        let b = registry.get_or_create("room-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_paths_get_distinct_rooms() {
        let registry = RoomRegistry::default();
        let a = registry.get_or_create("room-a").await.unwrap();
        let b = registry.get_or_create("room-b").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn store_factory_is_invoked_once_per_new_path() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let factory: StoreFactory = Arc::new(move |_path| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
        });
        let registry = RoomRegistry::new(Some(factory));
        registry.get_or_create("room-1").await.unwrap();
        registry.get_or_create("room-1").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
