//! Message routing for the relay.
//!
//! The broker decodes each inbound frame, answers pings, and fans valid
//! `doc`/`ephemeral` messages out to every other live connection. Payloads
//! are never interpreted: the same message is re-encoded and forwarded
//! as-is, whatever engine produced it.
//!
//! Fan-out is best effort. A target whose queue is closed is unregistered
//! after the pass, the remaining targets still get the message, and the
//! sender is never told about partial delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ProtocolError, RelayMessage, UpdateKind};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Why a frame was not acted on. The connection stays open in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, no tag, or an unknown tag
    Decode(ProtocolError),
    /// `doc`/`ephemeral` with an empty docId, peerId or update
    Invalid(ProtocolError),
    /// A server-to-client message (`pong`, `connected`) sent by a client
    Unexpected(&'static str),
    /// Raw binary frame; the protocol is text only
    Binary,
}

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A pong went back to the sender only
    Ponged,
    /// The message was fanned out to other connections
    Forwarded {
        kind: UpdateKind,
        delivered: usize,
        failed: usize,
    },
    Dropped(DropReason),
}

/// Broker counters, readable at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub frames_received: u64,
    pub messages_forwarded: u64,
    pub deliveries: u64,
    pub frames_dropped: u64,
    pub pongs_sent: u64,
    pub write_failures: u64,
}

/// Lock-free counters so the hot path never waits on a stats lock.
#[derive(Debug, Default)]
struct AtomicBrokerStats {
    frames_received: AtomicU64,
    messages_forwarded: AtomicU64,
    deliveries: AtomicU64,
    frames_dropped: AtomicU64,
    pongs_sent: AtomicU64,
    write_failures: AtomicU64,
}

/// Routes frames between the connections of one relay.
#[derive(Debug)]
pub struct RelayBroker {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBrokerStats,
}

impl Default for RelayBroker {
    fn default() -> Self {
        Self::new(Arc::new(ConnectionRegistry::new()))
    }
}

impl RelayBroker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBrokerStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection and greet it with its id.
    ///
    /// The `connected` message is queued before the record is visible to
    /// fan-out, so it is always the first frame the peer receives.
    pub async fn on_open(&self, handle: ConnectionHandle, remote_addr: impl Into<String>) -> u64 {
        let remote_addr = remote_addr.into();
        let id = self
            .registry
            .register_with(handle, remote_addr.clone(), |id, handle| {
                match RelayMessage::connected(id).encode() {
                    Ok(text) => {
                        if let Err(e) = handle.send_text(text) {
                            log::warn!("Could not greet client {id}: {e}");
                        }
                    }
                    Err(e) => log::error!("Failed to encode connected message: {e}"),
                }
            })
            .await;
        log::info!(
            "Client {id} connected from {remote_addr} (total: {})",
            self.registry.len().await
        );
        id
    }

    /// Forget a closed or failed connection. Other peers are not notified.
    pub async fn on_close(&self, id: u64) {
        if self.registry.unregister(id).await.is_some() {
            log::info!(
                "Client {id} disconnected (total: {})",
                self.registry.len().await
            );
        }
    }

    /// Handle one text frame from connection `id`.
    pub async fn on_frame(&self, id: u64, text: &str) -> FrameOutcome {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let msg = match RelayMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame from client {id}: {e}");
                return self.dropped(DropReason::Decode(e));
            }
        };
        log::debug!("Message from client {id}, type: {}", msg.tag());

        match &msg {
            RelayMessage::Ping { .. } => self.handle_ping(id).await,
            RelayMessage::Doc(_) | RelayMessage::Ephemeral(_) => self.forward(id, &msg).await,
            RelayMessage::Pong { .. } | RelayMessage::Connected { .. } => {
                log::warn!("Client {id} sent server-only message '{}'", msg.tag());
                self.dropped(DropReason::Unexpected(msg.tag()))
            }
        }
    }

    /// Note a raw binary frame from connection `id` and drop it.
    pub fn on_binary(&self, id: u64, len: usize) -> FrameOutcome {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        log::warn!("Dropping {len}-byte binary frame from client {id}: text frames only");
        self.dropped(DropReason::Binary)
    }

    async fn handle_ping(&self, id: u64) -> FrameOutcome {
        self.registry.touch(id).await;

        let sent = match RelayMessage::pong().encode() {
            Ok(text) => self.registry.send_to(id, &text).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                self.stats.pongs_sent.fetch_add(1, Ordering::Relaxed);
                log::debug!("Ping received from client {id}, sent pong");
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to send pong to client {id}: {e}");
                self.on_close(id).await;
            }
        }
        FrameOutcome::Ponged
    }

    async fn forward(&self, id: u64, msg: &RelayMessage) -> FrameOutcome {
        let Some((kind, payload)) = msg.update_payload() else {
            return self.dropped(DropReason::Unexpected(msg.tag()));
        };

        if let Err(e) = payload.validate() {
            log::warn!("Invalid {kind} message from client {id}: {e}");
            return self.dropped(DropReason::Invalid(e));
        }

        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to re-encode {kind} message from client {id}: {e}");
                return self.dropped(DropReason::Decode(e));
            }
        };

        let mut delivered = 0usize;
        let mut failed_ids = Vec::new();
        self.registry
            .for_each_except(id, |record| match record.handle.send_text(text.as_str()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::error!("Error forwarding {kind} message to client {}: {e}", record.id);
                    failed_ids.push(record.id);
                }
            })
            .await;

        for failed in &failed_ids {
            self.on_close(*failed).await;
        }

        self.stats.messages_forwarded.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .write_failures
            .fetch_add(failed_ids.len() as u64, Ordering::Relaxed);

        log::debug!(
            "Forwarded {kind} message for doc '{}' from peer '{}' (client {id}) to {delivered} other clients",
            payload.doc_id,
            payload.peer_id,
        );

        FrameOutcome::Forwarded {
            kind,
            delivered,
            failed: failed_ids.len(),
        }
    }

    fn dropped(&self, reason: DropReason) -> FrameOutcome {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Dropped(reason)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            messages_forwarded: self.stats.messages_forwarded.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            pongs_sent: self.stats.pongs_sent.load(Ordering::Relaxed),
            write_failures: self.stats.write_failures.load(Ordering::Relaxed),
        }
    }
}
