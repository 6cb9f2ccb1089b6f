//! # logos-relay — Real-time update relay for Logos
//!
//! Moves opaque CRDT updates between peers editing the same document. The
//! relay never looks inside an update; merging is the document engine's job.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ PeerSession │ ◄─────────────────► │ RelayServer │
//! │ (per peer)  │     JSON text       │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Heartbeat   │                     │ RelayBroker │
//! │ Reconnector │                     │ (fan-out)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                  ┌─────────┴──────────┐
//!                                  │ ConnectionRegistry │
//!                                  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages with base64 update payloads
//! - [`registry`] — Live connection records
//! - [`broker`] — Decode, validate, pong, fan-out
//! - [`server`] — WebSocket relay server
//! - [`heartbeat`] — Client keep-alive pings
//! - [`reconnect`] — Client reconnection state machine
//! - [`client`] — Peer session with event stream

pub mod protocol;
pub mod registry;
pub mod broker;
pub mod server;
pub mod heartbeat;
pub mod reconnect;
pub mod client;

// Re-exports for convenience
pub use protocol::{ProtocolError, RelayMessage, UpdateKind, UpdatePayload, DEFAULT_PORT};
pub use registry::{ConnectionHandle, ConnectionInfo, ConnectionRecord, ConnectionRegistry};
pub use broker::{BrokerStats, DropReason, FrameOutcome, RelayBroker};
pub use server::{RelayServer, ServerConfig, ServerHandle, ServerStatus};
pub use heartbeat::Heartbeat;
pub use reconnect::{ConnectionState, ReconnectDecision, ReconnectPolicy, Reconnector};
pub use client::{
    ClientConfig, PeerSession, Platform, SessionEvent, SessionStatus, default_server_url,
};
