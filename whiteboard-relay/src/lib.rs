//! # whiteboard-relay — Real-time sync relay for shared whiteboards
//!
//! Relays CRDT document updates and presence between every client editing
//! the same room. Each room keeps its own replica, so late joiners catch up
//! from the relay instead of from another client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)  │   y-protocols v1    │ (central)    │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ Yrs Doc     │                     │ RoomRegistry │
//! │ (local)     │                     │ name → Room  │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                              ┌─────────────┼──────────────┐
//!                              ▼             ▼              ▼
//!                          Replica   AwarenessTable  BroadcastGroup
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Sync and awareness frames over Yrs lib0 encoding
//! - [`document`] — Room replica over a Yrs doc
//! - [`awareness`] — Ephemeral presence with clocks and tombstones
//! - [`broadcast`] — Per-connection outboxes and room fan-out
//! - [`room`] — One room: replica, presence and peers under one lock
//! - [`registry`] / [`supervisor`] — Room lifecycle
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket client provider

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod supervisor;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessTable, ClientId};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, DeliveryError, Frame};
pub use client::{ClientError, ClientEvent, ConnectionState, RelayClient};
pub use config::ServerConfig;
pub use document::{Replica, ReplicaError};
pub use protocol::{AwarenessUpdate, DecodeError, Message, MessageKind, SyncMessage};
pub use registry::RoomRegistry;
pub use room::{FrameError, Room};
pub use server::{RelayError, RelayServer, ServerStats, StatsHandle};
pub use supervisor::RoomSupervisor;
