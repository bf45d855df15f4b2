//! WebSocket client for a relay room.
//!
//! Plays the provider role of an editor: keeps a local replica and
//! awareness table in step with the room, answers the relay's SyncStep1,
//! and pushes local record and presence changes.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::awareness::{AwarenessChange, AwarenessTable, ClientId};
use crate::document::{Replica, ReplicaError};
use crate::protocol::{Message, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The relay answered our SyncStep1. Never sent when it had nothing new.
    Synced,
    /// A remote change became visible locally
    RemoteUpdate(Vec<u8>),
    /// Remote presence changed
    Awareness(AwarenessChange),
    /// The relay closed the connection
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("awareness clock of client {0} is exhausted")]
    ClockExhausted(ClientId),
}

/// Shared between the client handle and its reader task.
struct Shared {
    replica: Mutex<Replica>,
    awareness: Mutex<AwarenessTable>,
    state: RwLock<ConnectionState>,
}

/// Connection to one relay room, with its own replica and presence.
pub struct RelayClient {
    room: String,
    client_id: ClientId,
    shared: Arc<Shared>,
    outgoing_tx: mpsc::Sender<WsMessage>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    reader: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to `{server_url}/{room}` and start the sync handshake.
    pub async fn connect(server_url: &str, room: &str) -> Result<Self, ClientError> {
        let url = format!("{}/{}", server_url.trim_end_matches('/'), room);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let replica = Replica::new();
        let client_id = replica.client_id();
        let step1 = Message::Sync(SyncMessage::SyncStep1(replica.state_vector())).encode();

        let shared = Arc::new(Shared {
            replica: Mutex::new(replica),
            awareness: Mutex::new(AwarenessTable::new()),
            state: RwLock::new(ConnectionState::Connected),
        });

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: apply inbound frames, answer step1, emit events
        let (event_tx, event_rx) = mpsc::channel(256);
        let reader_shared = shared.clone();
        let reader_out = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Binary(data)) => {
                        if let Err(e) = Self::handle_frame(&reader_shared, &data, &reader_out, &event_tx).await {
                            log::warn!("Client dropped frame: {e}");
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *reader_shared.state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        out_tx
            .send(WsMessage::Binary(step1.into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        log::debug!("Client {client_id} connected to {url}");
        Ok(Self {
            room: room.to_string(),
            client_id,
            shared,
            outgoing_tx: out_tx,
            event_rx: Some(event_rx),
            reader,
        })
    }

    async fn handle_frame(
        shared: &Shared,
        data: &[u8],
        out: &mpsc::Sender<WsMessage>,
        events: &mpsc::Sender<ClientEvent>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match Message::decode(data)? {
            Message::Sync(SyncMessage::SyncStep1(remote_sv)) => {
                let diff = shared.replica.lock().await.diff_state_vector(&remote_sv);
                let reply = Message::Sync(SyncMessage::SyncStep2(diff)).encode();
                out.send(WsMessage::Binary(reply.into())).await?;
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                let applied = shared.replica.lock().await.merge(&update)?;
                if let Some(applied) = applied {
                    let _ = events.send(ClientEvent::RemoteUpdate(applied)).await;
                }
                let _ = events.send(ClientEvent::Synced).await;
            }
            Message::Sync(SyncMessage::Update(update)) => {
                let applied = shared.replica.lock().await.merge(&update)?;
                if let Some(applied) = applied {
                    let _ = events.send(ClientEvent::RemoteUpdate(applied)).await;
                }
            }
            Message::Awareness(update) => {
                let change = shared.awareness.lock().await.apply_update(&update, Instant::now());
                if !change.is_empty() {
                    let _ = events.send(ClientEvent::Awareness(change)).await;
                }
            }
        }
        Ok(())
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Room this client joined.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Awareness client id, shared with the replica's Yrs client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Whether the reader task still sees an open socket.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Write a record locally and send the change to the room.
    pub async fn set_record(&self, id: &str, value: &str) -> Result<(), ClientError> {
        let update = self.shared.replica.lock().await.set_record(id, value);
        self.send(Message::Sync(SyncMessage::Update(update))).await
    }

    /// Delete a record locally and send the change, if it existed.
    pub async fn remove_record(&self, id: &str) -> Result<bool, ClientError> {
        let update = self.shared.replica.lock().await.remove_record(id);
        match update {
            Some(update) => {
                self.send(Message::Sync(SyncMessage::Update(update))).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Local value of one record.
    pub async fn record(&self, id: &str) -> Option<String> {
        self.shared.replica.lock().await.record(id)
    }

    /// Every local record, ordered by id.
    pub async fn records(&self) -> BTreeMap<String, String> {
        self.shared.replica.lock().await.records()
    }

    /// Announce local presence (name, cursor, selection, ...).
    pub async fn set_presence(&self, state: &serde_json::Value) -> Result<(), ClientError> {
        self.announce(Some(&state.to_string())).await
    }

    /// Withdraw local presence with a tombstone.
    pub async fn clear_presence(&self) -> Result<(), ClientError> {
        self.announce(None).await
    }

    async fn announce(&self, json: Option<&str>) -> Result<(), ClientError> {
        let update = {
            let mut awareness = self.shared.awareness.lock().await;
            awareness
                .set_state(self.client_id, json, Instant::now())
                .ok_or(ClientError::ClockExhausted(self.client_id))?;
            awareness.encode_update(&[self.client_id])
        };
        self.send(Message::Awareness(update)).await
    }

    /// Parsed presence of one client. Unparsable states read as absent.
    pub async fn presence(&self, client_id: ClientId) -> Option<serde_json::Value> {
        let state = self.shared.awareness.lock().await.state(client_id)?;
        serde_json::from_str(&state).ok()
    }

    /// Raw presence of everyone in the room, including ourselves.
    pub async fn awareness_states(&self) -> HashMap<ClientId, Arc<str>> {
        self.shared.awareness.lock().await.current_states()
    }

    /// Send a pre-built message to the relay.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.send_raw(message.encode()).await
    }

    /// Send raw bytes as one binary frame.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Close the connection.
    pub async fn close(self) {
        let _ = self.outgoing_tx.send(WsMessage::Close(None)).await;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), self.reader).await;
    }
}
