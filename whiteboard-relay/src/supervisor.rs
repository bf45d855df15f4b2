//! Room lifecycle: joins, leaves and presence expiry across rooms.
//!
//! The supervisor turns connection-count transitions into registry calls.
//! The first join of a name creates the room, the last leave releases it,
//! and a join that lands on a room being torn down retries on a fresh one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::broadcast::{ConnectionId, Frame, PeerHandle};
use crate::registry::RoomRegistry;
use crate::room::Room;

#[derive(Clone)]
pub struct RoomSupervisor {
    registry: Arc<RoomRegistry>,
}

impl RoomSupervisor {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Add a connection to the room called `name`, creating it if needed.
    ///
    /// Returns the room and the greeting frames for the new connection.
    pub async fn join(&self, name: &str, handle: PeerHandle) -> (Arc<Room>, Vec<Frame>) {
        loop {
            let room = self.registry.resolve(name).await;
            if let Some(greeting) = room.join(handle.clone()).await {
                return (room, greeting);
            }
            log::debug!("Room {name} closed during join, resolving again");
        }
    }

    /// Remove a connection; releases the room when it was the last one.
    pub async fn leave(&self, room: &Arc<Room>, id: &ConnectionId) {
        if room.leave(id).await {
            self.registry.release(room).await;
        }
    }

    /// Expire stale presence in every active room and forget tombstones
    /// older than `tombstone_ttl`. Returns how many entries were tombstoned.
    pub async fn sweep_awareness(&self, now: Instant, timeout: Duration, tombstone_ttl: Duration) -> usize {
        let mut expired = 0;
        for room in self.registry.rooms().await {
            expired += room.expire_awareness(now, timeout).await.len();
            room.purge_tombstones(now, tombstone_ttl).await;
        }
        expired
    }

    /// Run `sweep_awareness` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration, timeout: Duration, tombstone_ttl: Duration) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = supervisor.sweep_awareness(Instant::now(), timeout, tombstone_ttl).await;
                if expired > 0 {
                    log::debug!("Awareness sweep expired {expired} entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::awareness_update;
    use crate::broadcast::peer_channel;
    use crate::document::Replica;
    use crate::protocol::{Message, SyncMessage};
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(30);
    const TOMBSTONE_TTL: Duration = Duration::from_secs(300);

    fn supervisor() -> RoomSupervisor {
        RoomSupervisor::new(Arc::new(RoomRegistry::new()))
    }

    #[tokio::test]
    async fn test_join_creates_and_leave_destroys() {
        let sup = supervisor();
        let id = Uuid::new_v4();
        let (handle, _outbox) = peer_channel(id, 4);

        let (room, greeting) = sup.join("R1", handle).await;
        assert_eq!(greeting.len(), 1);
        assert_eq!(sup.registry().room_count().await, 1);
        assert_eq!(room.connection_count().await, 1);

        sup.leave(&room, &id).await;
        assert_eq!(sup.registry().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_teardown_yields_fresh_document() {
        let sup = supervisor();
        let id = Uuid::new_v4();
        let (handle, _outbox) = peer_channel(id, 4);
        let (room, _) = sup.join("R1", handle).await;

        let update = Replica::new().set_record("s1", "{}");
        room.handle_frame(&id, &Message::Sync(SyncMessage::Update(update)).encode())
            .await
            .unwrap();
        assert_ne!(room.state_summary().await, vec![0]);
        sup.leave(&room, &id).await;

        let again = sup.registry().resolve("R1").await;
        assert_ne!(again.instance_id(), room.instance_id());
        assert_eq!(again.state_summary().await, vec![0]);
    }

    #[tokio::test]
    async fn test_join_after_teardown_uses_new_room() {
        let sup = supervisor();
        let stale = sup.registry().resolve("R1").await;
        assert!(sup.registry().release(&stale).await);

        let (handle, _outbox) = peer_channel(Uuid::new_v4(), 4);
        let (room, _) = sup.join("R1", handle).await;
        assert_ne!(room.instance_id(), stale.instance_id());
        assert_eq!(room.connection_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_share_one_room() {
        let sup = supervisor();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let sup = sup.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, outbox) = peer_channel(Uuid::new_v4(), 4);
                let (room, _) = sup.join("fresh", handle).await;
                (room.instance_id(), outbox)
            }));
        }

        let mut instances = Vec::new();
        let mut outboxes = Vec::new();
        for task in tasks {
            let (instance, outbox) = task.await.unwrap();
            instances.push(instance);
            outboxes.push(outbox);
        }
        instances.dedup();
        assert_eq!(instances.len(), 1);

        let room = sup.registry().get("fresh").await.unwrap();
        assert_eq!(room.connection_count().await, 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_leave_churn_leaves_no_orphans() {
        let sup = supervisor();
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let sup = sup.clone();
            tasks.push(tokio::spawn(async move {
                let id = Uuid::new_v4();
                let (handle, _outbox) = peer_channel(id, 4);
                let (room, _) = sup.join("churn", handle).await;
                tokio::task::yield_now().await;
                sup.leave(&room, &id).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(sup.registry().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_across_rooms() {
        let sup = supervisor();
        let mut outboxes = Vec::new();
        let mut rooms = Vec::new();
        for name in ["A", "B"] {
            let id = Uuid::new_v4();
            let (handle, outbox) = peer_channel(id, 4);
            let (room, _) = sup.join(name, handle).await;
            room.handle_frame(&id, &Message::Awareness(awareness_update([(1, 1, "{}")])).encode())
                .await
                .unwrap();
            outboxes.push(outbox);
            rooms.push(room);
        }

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(sup.sweep_awareness(later, TIMEOUT, TOMBSTONE_TTL).await, 2);
        assert_eq!(sup.sweep_awareness(later, TIMEOUT, TOMBSTONE_TTL).await, 0);
        assert_eq!(rooms[0].awareness_len().await, 1);

        let much_later = later + TOMBSTONE_TTL;
        assert_eq!(sup.sweep_awareness(much_later, TIMEOUT, TOMBSTONE_TTL).await, 0);
        for room in &rooms {
            assert_eq!(room.awareness_len().await, 0);
        }
    }
}
