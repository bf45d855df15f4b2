//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host:port/R1 ──┐
//!                     ├── Room "R1" ── Replica (yrs) ── BroadcastGroup
//! ws://host:port/R1 ──┘        │                             │
//!                              └── AwarenessTable            ├─► outbox A
//!                                                            └─► outbox B
//! ```
//!
//! One task per connection. The task owns both halves of its socket: it
//! reads inbound frames and applies them to its room, and it drains its own
//! outbox onto the wire. Fan-out only ever touches other connections'
//! outboxes, so a slow reader stalls nobody but itself.
//!
//! Per connection:
//! 1. The room name is the request path after the leading `/`, verbatim.
//!    An empty name closes the connection immediately.
//! 2. The room greets with SyncStep1 and, when anyone is present, the full
//!    awareness state.
//! 3. Inbound frames are applied in arrival order; replies go straight back,
//!    changes go to every other connection of the room.
//! 4. On close, error or eviction the connection leaves its room exactly
//!    once, which tombstones its presence and may release the room.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{peer_channel, ConnectionId, Frame, Outbox};
use crate::config::ServerConfig;
use crate::registry::RoomRegistry;
use crate::room::{FrameError, Room};
use crate::supervisor::RoomSupervisor;

/// How long a closing handshake may take before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsSender = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub decode_failures: u64,
    pub active_rooms: usize,
}

/// Counters updated from connection tasks without locking.
#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    decode_failures: AtomicU64,
}

/// The relay server, bound and ready to serve.
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    supervisor: RoomSupervisor,
    stats: Arc<AtomicServerStats>,
}

impl RelayServer {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self, RelayError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr: addr.clone(), source })?;
        log::info!("Relay listening on ws://{}", listener.local_addr()?);

        Ok(Self {
            config,
            listener,
            supervisor: RoomSupervisor::new(Arc::new(RoomRegistry::new())),
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// Address the listener is bound to, with the real port when 0 was asked for.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared room registry.
    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.supervisor.registry().clone()
    }

    /// Handle for reading statistics while the server runs.
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            stats: self.stats.clone(),
            registry: self.registry(),
        }
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<(), RelayError> {
        self.serve(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Returning drops the listener. Connection tasks already running are
    /// left to the runtime.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let sweeper = self.supervisor.spawn_sweeper(
            self.config.sweep_interval,
            self.config.awareness_timeout,
            self.config.tombstone_ttl,
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down relay");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let supervisor = self.supervisor.clone();
                    let config = self.config.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, supervisor, config, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    /// Handle a single WebSocket connection from handshake to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        supervisor: RoomSupervisor,
        config: ServerConfig,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), RelayError> {
        let mut path = String::new();
        let mut ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await?;

        let room_name = path.strip_prefix('/').unwrap_or(&path).to_string();
        if room_name.is_empty() {
            log::info!("Rejecting connection from {addr}: no room in path");
            ws_stream.close(None).await?;
            return Ok(());
        }

        let conn_id: ConnectionId = Uuid::new_v4();
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("New connection {conn_id} from {addr} to room: {room_name}");

        let (handle, outbox) = peer_channel(conn_id, config.outbound_capacity);
        let (room, greeting) = supervisor.join(&room_name, handle).await;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let result = Self::session(&room, conn_id, greeting, ws_sender, ws_receiver, outbox, &config, &stats).await;

        supervisor.leave(&room, &conn_id).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} closed for room: {room_name}");
        result
    }

    /// Protocol loop of one joined connection.
    #[allow(clippy::too_many_arguments)]
    async fn session(
        room: &Arc<Room>,
        conn_id: ConnectionId,
        greeting: Vec<Frame>,
        mut ws_sender: WsSender,
        mut ws_receiver: WsReceiver,
        mut outbox: Outbox,
        config: &ServerConfig,
        stats: &AtomicServerStats,
    ) -> Result<(), RelayError> {
        for frame in greeting {
            ws_sender.send(WsMessage::Binary(frame.to_vec().into())).await?;
        }

        let eviction = outbox.eviction();
        let mut decode_failures = 0u32;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            stats.total_frames.fetch_add(1, Ordering::Relaxed);
                            match room.handle_frame(&conn_id, &data).await {
                                Ok(reply) => {
                                    decode_failures = 0;
                                    if let Some(reply) = reply {
                                        ws_sender.send(WsMessage::Binary(reply.to_vec().into())).await?;
                                    }
                                }
                                Err(FrameError::Decode(e)) => {
                                    stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                                    decode_failures += 1;
                                    log::warn!("Dropping malformed frame from {conn_id}: {e}");
                                    if decode_failures >= config.max_decode_failures {
                                        log::warn!("Closing {conn_id} after {decode_failures} malformed frames");
                                        break;
                                    }
                                }
                                Err(FrameError::Merge(e)) => {
                                    log::warn!("Dropping update from {conn_id} in room {}: {e}", room.name());
                                }
                            }
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }

                        Some(Ok(WsMessage::Close(_))) | None => break,

                        Some(Ok(WsMessage::Text(_))) => {
                            log::debug!("Ignoring text message from {conn_id}");
                        }

                        Some(Ok(_)) => {}

                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                // Outgoing fan-out from the room
                frame = outbox.recv() => {
                    let Some(frame) = frame else { break };
                    // A peer that stopped reading parks this write forever
                    tokio::select! {
                        sent = ws_sender.send(WsMessage::Binary(frame.to_vec().into())) => sent?,
                        _ = eviction.notified() => {
                            log::warn!("Evicting slow consumer {conn_id} from room {}", room.name());
                            break;
                        }
                    }
                }

                _ = eviction.notified() => {
                    log::warn!("Evicting slow consumer {conn_id} from room {}", room.name());
                    break;
                }
            }
        }

        // Best effort: the peer may already be gone or not reading.
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_sender.close()).await;
        Ok(())
    }
}

/// Read-only view of a running server's statistics.
#[derive(Clone)]
pub struct StatsHandle {
    stats: Arc<AtomicServerStats>,
    registry: Arc<RoomRegistry>,
}

impl StatsHandle {
    /// Current counters plus the number of active rooms.
    pub async fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = RelayServer::bind(local_config()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.registry().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let first = RelayServer::bind(local_config()).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        let config = ServerConfig { port: taken, ..local_config() };
        assert!(matches!(RelayServer::bind(config).await, Err(RelayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = RelayServer::bind(local_config()).await.unwrap();
        let stats = server.stats_handle().snapshot().await;
        assert_eq!(stats, ServerStats::default());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = RelayServer::bind(local_config()).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
