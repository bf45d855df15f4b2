//! Fan-out to N-1 peers with per-peer backpressure.
//!
//! Every connection owns a bounded outbound queue. Broadcasting pushes a
//! shared, pre-encoded frame into each queue with `try_send`, so the
//! broadcasting task never waits on a slow reader. A peer whose queue is
//! full is evicted: its connection task is notified, closes the socket and
//! runs the ordinary close path. Dropping frames instead would leave that
//! peer's replica silently diverged.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Identity of one live connection, unique within the process.
pub type ConnectionId = Uuid;

/// Pre-encoded frame shared by every recipient.
pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue full, peer evicted")]
    Full,
    #[error("peer already disconnected")]
    Closed,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Sending half held by the room.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    evict: Arc<Notify>,
}

impl PeerHandle {
    /// Connection this handle delivers to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.evict.notify_one();
                DeliveryError::Full
            }
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Receiving half owned by the connection task.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::Receiver<Frame>,
    evict: Arc<Notify>,
}

impl Outbox {
    /// Next queued frame; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Signal raised when the room gave up on this peer.
    ///
    /// Held separately from the queue so both can be awaited in one `select!`.
    pub fn eviction(&self) -> Arc<Notify> {
        self.evict.clone()
    }

    /// Next queued frame if one is ready.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// Create the queue pair for one connection.
pub fn peer_channel(id: ConnectionId, capacity: usize) -> (PeerHandle, Outbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let evict = Arc::new(Notify::new());
    (
        PeerHandle { id, tx, evict: evict.clone() },
        Outbox { rx, evict },
    )
}

/// The set of peers of one room.
///
/// Lives inside the room state, so every call is already serialized by the
/// room's lock.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, PeerHandle>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer; a handle with a known id replaces the old one.
    pub fn add_peer(&mut self, handle: PeerHandle) {
        self.peers.insert(handle.id, handle);
    }

    /// Unregister a peer, returning its handle if it was present.
    pub fn remove_peer(&mut self, id: &ConnectionId) -> Option<PeerHandle> {
        self.peers.remove(id)
    }

    /// Send to one peer.
    pub fn send_to(&mut self, id: &ConnectionId, frame: Frame) -> Result<(), DeliveryError> {
        let peer = self.peers.get(id).ok_or(DeliveryError::Closed)?;
        let result = peer.deliver(frame);
        self.record(id, result);
        result
    }

    /// Send to every peer except `origin`. Returns how many accepted it.
    pub fn broadcast(&mut self, origin: Option<&ConnectionId>, frame: &Frame) -> usize {
        let mut outcomes = Vec::with_capacity(self.peers.len());
        for (id, peer) in &self.peers {
            if Some(id) == origin {
                continue;
            }
            outcomes.push((*id, peer.deliver(frame.clone())));
        }

        let mut delivered = 0;
        for (id, result) in outcomes {
            if result.is_ok() {
                delivered += 1;
            }
            self.record(&id, result);
        }
        delivered
    }

    fn record(&mut self, id: &ConnectionId, result: Result<(), DeliveryError>) {
        match result {
            Ok(()) => self.messages_sent += 1,
            Err(e) => {
                self.messages_dropped += 1;
                log::warn!("Delivery to {id} failed: {e}");
            }
        }
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True when no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether `id` is registered.
    pub fn has_peer(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    /// Registered connection ids, in no particular order.
    pub fn peer_ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    /// Delivery counters since the group was created.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }
}
