//! Room registry: one atomic get-or-create map from room id to live room.
//!
//! The registry is an explicit object owned by the server's composition
//! root — never module-level state — so tests can run several isolated
//! registries side by side. Rooms are created lazily on first connection,
//! hydrated from the latest stored version when a store is configured, and
//! evicted by a background sweep once idle beyond a configurable timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::room::{Room, RoomStats};
use crate::storage::VersionStore;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Debounce window between the last edit and a snapshot save.
    pub debounce: Duration,
    /// How long a room may sit with zero connections before eviction.
    pub idle_timeout: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            debounce: crate::room::DEFAULT_DEBOUNCE,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Maps room ids to live rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: Option<Arc<VersionStore>>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(store: Option<Arc<VersionStore>>, config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Get the room for `room_id`, creating and hydrating it if absent.
    ///
    /// Two simultaneous first-connections to a new id race on the write
    /// lock; the loser re-checks and adopts the winner's room, so exactly
    /// one room ever exists per id.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock. Touching the room here renews its idle
        // deadline while the eviction sweep is excluded by the registry
        // lock, so the sweep cannot close a room a caller is about to join.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                room.touch().await;
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            room.touch().await;
            return room.clone();
        }

        let room = Room::new(room_id, self.store.clone(), self.config.debounce);
        if let Some(store) = &self.store {
            // RocksDB reads block; keep them off the runtime threads even
            // though the registry write lock stays held for the hydration.
            let store = Arc::clone(store);
            let id = room_id.to_string();
            match tokio::task::spawn_blocking(move || store.load_latest(&id)).await {
                Ok(Ok(Some(snapshot))) => {
                    if let Err(e) = room.hydrate(&snapshot).await {
                        log::warn!("room {room_id}: stored snapshot failed to apply: {e}");
                    } else {
                        log::info!("room {room_id}: hydrated from latest stored version");
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => log::warn!("room {room_id}: snapshot lookup failed: {e}"),
                Err(e) => log::warn!("room {room_id}: snapshot lookup task failed: {e}"),
            }
        }

        rooms.insert(room_id.to_string(), room.clone());
        log::info!("room {room_id}: created ({} total)", rooms.len());
        room
    }

    /// Look a room up without creating it.
    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Stats snapshot of every live room, for the inspection API.
    pub async fn stats_all(&self) -> Vec<RoomStats> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(rooms.len());
        for room in rooms {
            stats.push(room.stats().await);
        }
        stats
    }

    pub fn store(&self) -> Option<&Arc<VersionStore>> {
        self.store.as_ref()
    }

    /// Evict every room that has been connection-free past the idle timeout.
    /// Returns the number of rooms removed.
    pub async fn evict_idle(&self) -> usize {
        let candidates: Vec<(String, Arc<Room>)> = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .map(|(id, room)| (id.clone(), room.clone()))
                .collect()
        };

        let mut evicted = 0;
        for (id, room) in candidates {
            if !room.idle_for(self.config.idle_timeout).await {
                continue;
            }
            let mut rooms = self.rooms.write().await;
            // A connection may have arrived since the idle check.
            if room.idle_for(self.config.idle_timeout).await {
                rooms.remove(&id);
                drop(rooms);
                room.close().await;
                log::info!("room {id}: evicted (idle)");
                evicted += 1;
            }
        }
        evicted
    }

    /// Spawn the periodic eviction sweep.
    pub fn spawn_eviction_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle().await;
                if evicted > 0 {
                    log::debug!("eviction sweep removed {evicted} idle rooms");
                }
            }
        })
    }

    /// Close every room (process shutdown): final snapshots are flushed.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut map = self.rooms.write().await;
            map.drain().map(|(_, room)| room).collect()
        };
        for room in rooms {
            room.close().await;
        }
    }
}
