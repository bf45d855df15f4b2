//! A room: one replica, one awareness table, one connection set.
//!
//! All state of a room sits behind a single lock. Every frame from any
//! connection of the room is processed under it, so merge, awareness
//! bookkeeping and the resulting fan-out happen atomically with respect to
//! the room's other connections. Different rooms never share a lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessTable, ClientId, TOMBSTONE};
use crate::broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame, PeerHandle};
use crate::document::{is_empty_update, Replica, ReplicaError};
use crate::protocol::{sync_label, AwarenessUpdate, DecodeError, Message, SyncMessage};

/// Live awareness ids a single connection may announce.
pub const MAX_CLIENT_IDS_PER_CONNECTION: usize = 16;

/// Why an inbound frame was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("merge failed: {0}")]
    Merge(#[from] ReplicaError),
}

struct RoomState {
    replica: Replica,
    awareness: AwarenessTable,
    peers: BroadcastGroup,
    /// Awareness client ids announced through each connection.
    controlled: HashMap<ConnectionId, HashSet<ClientId>>,
    /// Set when the registry tears the room down; joins must re-resolve.
    closed: bool,
}

pub struct Room {
    name: String,
    instance_id: Uuid,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: Uuid::new_v4(),
            state: Mutex::new(RoomState {
                replica: Replica::new(),
                awareness: AwarenessTable::new(),
                peers: BroadcastGroup::new(),
                controlled: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Room name as taken from the request path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes successive rooms that reuse a name.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Register a connection and build its greeting.
    ///
    /// The greeting is the room's SyncStep1, followed by the full awareness
    /// state when anyone is present. Returns `None` if the room was torn
    /// down in the meantime; the caller must resolve again.
    pub async fn join(&self, handle: PeerHandle) -> Option<Vec<Frame>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }

        let id = handle.id();
        state.peers.add_peer(handle);
        state.controlled.entry(id).or_default();

        let mut greeting = vec![Arc::new(
            Message::Sync(SyncMessage::SyncStep1(state.replica.state_vector())).encode(),
        )];
        if let Some(update) = state.awareness.encode_full_state() {
            greeting.push(Arc::new(Message::Awareness(update).encode()));
        }

        log::debug!("Connection {id} joined room {} ({} peers)", self.name, state.peers.peer_count());
        Some(greeting)
    }

    /// Process one inbound frame from `origin`.
    ///
    /// Returns a frame to send straight back to the origin, if any. Changes
    /// are fanned out to the other connections before this returns.
    pub async fn handle_frame(&self, origin: &ConnectionId, frame: &[u8]) -> Result<Option<Frame>, FrameError> {
        let message = Message::decode(frame)?;
        let mut state = self.state.lock().await;

        match message {
            Message::Sync(sync) => {
                let label = sync_label(&sync);
                match sync {
                    SyncMessage::SyncStep1(remote_sv) => {
                        let diff = state.replica.diff_state_vector(&remote_sv);
                        if is_empty_update(&diff) {
                            return Ok(None);
                        }
                        Ok(Some(Arc::new(Message::Sync(SyncMessage::SyncStep2(diff)).encode())))
                    }
                    SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                        if let Some(applied) = state.replica.merge(&update)? {
                            let frame = Arc::new(Message::Sync(SyncMessage::Update(applied)).encode());
                            let delivered = state.peers.broadcast(Some(origin), &frame);
                            log::debug!("{label} from {origin} in room {} relayed to {delivered} peers", self.name);
                        } else {
                            log::trace!("{label} from {origin} in room {} was already known", self.name);
                        }
                        Ok(None)
                    }
                }
            }

            Message::Awareness(mut update) => {
                let owned = state.controlled.entry(*origin).or_default();
                let refused = cap_new_ids(owned, &mut update);
                if refused > 0 {
                    log::warn!(
                        "Connection {origin} in room {} exceeded {MAX_CLIENT_IDS_PER_CONNECTION} awareness ids, dropped {refused}",
                        self.name
                    );
                }

                let change = state.awareness.apply_update(&update, Instant::now());
                if change.is_empty() {
                    return Ok(None);
                }
                track_controlled(&mut state.controlled, origin, &change);

                let relayed = state.awareness.encode_update(&change.changed());
                let frame = Arc::new(Message::Awareness(relayed).encode());
                state.peers.broadcast(Some(origin), &frame);
                log::trace!(
                    "Awareness from {origin} in room {}: +{} ~{} -{}",
                    self.name,
                    change.added.len(),
                    change.updated.len(),
                    change.removed.len()
                );
                Ok(None)
            }
        }
    }

    /// Drop a connection and tombstone the awareness ids it controlled.
    ///
    /// The removal is broadcast to the remaining peers. Returns whether the
    /// room has no connections left.
    pub async fn leave(&self, id: &ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        state.peers.remove_peer(id);

        let owned: Vec<ClientId> = state
            .controlled
            .remove(id)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();
        let removed = state.awareness.remove_clients(&owned, Instant::now());
        if !removed.is_empty() {
            let frame = Arc::new(Message::Awareness(state.awareness.encode_update(&removed)).encode());
            state.peers.broadcast(None, &frame);
            log::debug!("Removed awareness {removed:?} of {id} in room {}", self.name);
        }

        state.peers.is_empty()
    }

    /// Tombstone presence entries not renewed within `timeout`.
    pub async fn expire_awareness(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let mut state = self.state.lock().await;
        let expired = state.awareness.expire(now, timeout);
        if !expired.is_empty() {
            for ids in state.controlled.values_mut() {
                for id in &expired {
                    ids.remove(id);
                }
            }
            let frame = Arc::new(Message::Awareness(state.awareness.encode_update(&expired)).encode());
            state.peers.broadcast(None, &frame);
            log::debug!("Expired awareness {expired:?} in room {}", self.name);
        }
        expired
    }

    /// Forget tombstones older than `horizon`.
    pub async fn purge_tombstones(&self, now: Instant, horizon: Duration) -> usize {
        let purged = self.state.lock().await.awareness.purge_tombstones(now, horizon);
        if purged > 0 {
            log::trace!("Purged {purged} awareness tombstones in room {}", self.name);
        }
        purged
    }

    /// Mark the room closed if it has no connections. Returns whether it did.
    pub(crate) async fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.peers.is_empty() {
            state.closed = true;
        }
        state.closed
    }

    /// Connections currently joined.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.peers.peer_count()
    }

    /// True once the registry has torn the room down.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Encoded state vector of the room's replica.
    pub async fn state_summary(&self) -> Vec<u8> {
        self.state.lock().await.replica.state_summary()
    }

    /// Full document as one update.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.replica.encode_state()
    }

    /// Live presence states keyed by awareness client id.
    pub async fn awareness_states(&self) -> HashMap<ClientId, Arc<str>> {
        self.state.lock().await.awareness.current_states()
    }

    /// Awareness entries held, tombstones included.
    pub async fn awareness_len(&self) -> usize {
        self.state.lock().await.awareness.len()
    }

    /// Fan-out counters of this room.
    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.state.lock().await.peers.stats()
    }
}

/// Drop live entries for ids the connection does not own yet once it
/// already owns the maximum. Returns how many were dropped.
fn cap_new_ids(owned: &HashSet<ClientId>, update: &mut AwarenessUpdate) -> usize {
    let mut free = MAX_CLIENT_IDS_PER_CONNECTION.saturating_sub(owned.len());
    let before = update.clients.len();
    let mut ids: Vec<ClientId> = update.clients.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let tombstone = update.clients.get(&id).is_some_and(|e| &*e.json == TOMBSTONE);
        if owned.contains(&id) || tombstone {
            continue;
        }
        if free > 0 {
            free -= 1;
        } else {
            update.clients.remove(&id);
        }
    }
    before - update.clients.len()
}

/// Live ids become owned by `origin`; removed ids are released everywhere.
fn track_controlled(
    controlled: &mut HashMap<ConnectionId, HashSet<ClientId>>,
    origin: &ConnectionId,
    change: &AwarenessChange,
) {
    if !change.removed.is_empty() {
        for ids in controlled.values_mut() {
            for id in &change.removed {
                ids.remove(id);
            }
        }
    }
    controlled
        .entry(*origin)
        .or_default()
        .extend(change.added.iter().chain(&change.updated));
}
