//! Live connection registry for the relay.
//!
//! Every accepted WebSocket gets one [`ConnectionRecord`] keyed by a
//! process-unique id. Ids start at 1, only ever grow and are never reused,
//! even after the connection that held them is gone.
//!
//! The map sits behind an async `RwLock`: fan-out holds the read side while
//! it walks the records, register/unregister take the write side. A target
//! unregistered while a broadcast is in flight simply misses that message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{now_millis, ProtocolError};

/// Outbound queue of one connection.
///
/// The connection task drains the receiving half into the socket. Once
/// that task is gone every send fails, which the broker treats as a write
/// failure for this target.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its connection task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(Message::text(text.into()))
    }

    /// Queue a raw WebSocket message (close, control frames).
    pub fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.tx.send(msg).map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Whether the connection task is still draining this queue.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Server-side record of one live connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: u64,
    pub handle: ConnectionHandle,
    pub remote_addr: String,
    /// Milliseconds since the Unix epoch
    pub connected_at: i64,
    /// Milliseconds since the Unix epoch; starts equal to `connected_at`
    pub last_ping_at: i64,
}

impl ConnectionRecord {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote_addr: self.remote_addr.clone(),
            connected_at: self.connected_at,
            last_ping_at: self.last_ping_at,
            open: self.handle.is_open(),
        }
    }
}

/// Read-only snapshot of a record, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_addr: String,
    pub connected_at: i64,
    pub last_ping_at: i64,
    pub open: bool,
}

/// Concurrency-safe map of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<u64, ConnectionRecord>>>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next id and insert a record for it.
    pub async fn register(&self, handle: ConnectionHandle, remote_addr: impl Into<String>) -> u64 {
        self.register_with(handle, remote_addr, |_, _| {}).await
    }

    /// Like [`register`](Self::register), but runs `greet` on the handle
    /// before the record becomes visible. Anything `greet` queues is ahead
    /// of every frame a concurrent broadcast can queue for this connection.
    pub async fn register_with<F>(
        &self,
        handle: ConnectionHandle,
        remote_addr: impl Into<String>,
        greet: F,
    ) -> u64
    where
        F: FnOnce(u64, &ConnectionHandle),
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        greet(id, &handle);
        let now = now_millis();
        let record = ConnectionRecord {
            id,
            handle,
            remote_addr: remote_addr.into(),
            connected_at: now,
            last_ping_at: now,
        };
        self.connections.write().await.insert(id, record);
        id
    }

    /// Remove a record. Returns its last snapshot if it was present.
    pub async fn unregister(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections
            .write()
            .await
            .remove(&id)
            .map(|record| record.info())
    }

    /// Snapshot of one record.
    pub async fn get(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&id).map(|r| r.info())
    }

    /// Stamp `last_ping_at` with the current time. Returns false if absent.
    pub async fn touch(&self, id: u64) -> bool {
        match self.connections.write().await.get_mut(&id) {
            Some(record) => {
                record.last_ping_at = now_millis();
                true
            }
            None => false,
        }
    }

    /// Send a text frame to one connection.
    pub async fn send_to(&self, id: u64, text: &str) -> Result<(), ProtocolError> {
        let connections = self.connections.read().await;
        match connections.get(&id) {
            Some(record) => record.handle.send_text(text),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Apply `f` to every live record except `id`.
    pub async fn for_each_except<F>(&self, id: u64, mut f: F)
    where
        F: FnMut(&ConnectionRecord),
    {
        let connections = self.connections.read().await;
        for record in connections.values().filter(|r| r.id != id) {
            f(record);
        }
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Snapshots of all live records, ordered by id.
    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .values()
            .map(|r| r.info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic_and_never_reused() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = ConnectionHandle::channel();
        let (h2, _rx2) = ConnectionHandle::channel();
        let (h3, _rx3) = ConnectionHandle::channel();

        let a = registry.register(h1, "10.0.0.1:1").await;
        let b = registry.register(h2, "10.0.0.2:1").await;
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        registry.unregister(b).await;
        let c = registry.register(h3, "10.0.0.3:1").await;
        assert_eq!(c, 3);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_register_records_metadata() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel();
        let id = registry.register(handle, "127.0.0.1:5555").await;

        let info = registry.get(id).await.unwrap();
        assert_eq!(info.remote_addr, "127.0.0.1:5555");
        assert_eq!(info.connected_at, info.last_ping_at);
        assert!(info.open);
    }

    #[tokio::test]
    async fn test_greet_runs_before_record_is_visible() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::channel();
        let mut seen_len = None;
        let id = registry
            .register_with(handle, "a", |id, handle| {
                seen_len = Some(registry.connections.try_read().map(|c| c.len()).ok());
                handle.send_text(format!("hello {id}")).unwrap();
            })
            .await;

        assert_eq!(seen_len, Some(Some(0)));
        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), format!("hello {id}")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(registry.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_unregister_missing() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(42).await.is_none());
        assert!(registry.get(42).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_touch_updates_last_ping() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel();
        let id = registry.register(handle, "a").await;
        let before = registry.get(id).await.unwrap().last_ping_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.touch(id).await);
        assert!(registry.get(id).await.unwrap().last_ping_at >= before);
        assert!(!registry.touch(id + 1).await);
    }

    #[tokio::test]
    async fn test_for_each_except_skips_one() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let (handle, rx) = ConnectionHandle::channel();
            ids.push(registry.register(handle, format!("peer{i}")).await);
            receivers.push(rx);
        }

        let mut visited = Vec::new();
        registry
            .for_each_except(ids[1], |record| visited.push(record.id))
            .await;
        visited.sort();
        assert_eq!(visited, vec![ids[0], ids[2], ids[3]]);
    }

    #[tokio::test]
    async fn test_closed_handle_reports_failure() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = ConnectionHandle::channel();
        let id = registry.register(handle, "gone").await;
        drop(rx);

        assert!(!registry.get(id).await.unwrap().open);
        assert_eq!(
            registry.send_to(id, "{}").await,
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_snapshot_sorted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, rx) = ConnectionHandle::channel();
                (registry.register(handle, format!("c{i}")).await, rx)
            }));
        }
        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.unwrap().1);
        }

        let ids: Vec<u64> = registry.snapshot().await.iter().map(|i| i.id).collect();
        assert_eq!(ids, (1..=16).collect::<Vec<_>>());
    }
}
