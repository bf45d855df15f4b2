//! Room registry: process-wide map from room name to room.
//!
//! Per name the lifecycle is `absent → active → absent`. `resolve` creates
//! under the map's write lock, so concurrent first joins agree on one room.
//! `release` re-checks emptiness under that same write lock and flips the
//! room's `closed` flag under the room lock before unmapping it; a join
//! that raced with the teardown sees the flag and resolves again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::room::Room;

/// Active rooms by name.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room for `name`.
    pub async fn resolve(&self, name: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_string(), room.clone());
        log::info!("Room {name} created");
        room
    }

    /// Tear `room` down if it has no connections left.
    ///
    /// Returns whether the room was removed.
    pub async fn release(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().await;
        let mapped = rooms.get(room.name()).is_some_and(|r| Arc::ptr_eq(r, room));
        if !mapped {
            // A closed room is unmapped in the same critical section, so
            // only a double release can get here.
            if !room.is_closed().await {
                log::error!("Room {} is live but not registered", room.name());
                debug_assert!(false, "unregistered live room {}", room.name());
            }
            return false;
        }

        if !room.close_if_empty().await {
            log::debug!("Room {} gained a connection before release", room.name());
            return false;
        }

        rooms.remove(room.name());
        log::info!("Room {} is empty, document removed", room.name());
        true
    }

    /// The room mapped to `name`, without creating one.
    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Names of active rooms, in no particular order.
    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Snapshot of every active room.
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }
}
