//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                                      ┌──► Peer B
//!           ├── handle_connection ── RelayBroker ──┤
//! Peer C ──┘         │                   │         └──► Peer D
//!                    │                   ▼
//!              outbound queue    ConnectionRegistry
//! ```
//!
//! One task per connection owns both halves of its socket: it feeds inbound
//! frames to the broker and drains the connection's outbound queue, which is
//! where the broker puts pongs and forwarded updates. The server keeps no
//! document state.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::broker::{BrokerStats, RelayBroker};
use crate::protocol::DEFAULT_PORT;
use crate::registry::{ConnectionHandle, ConnectionInfo, ConnectionRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
        }
    }
}

impl ServerConfig {
    /// Listen on all interfaces at `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{port}"),
        }
    }
}

/// Point-in-time view of the relay.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub port: u16,
    pub client_count: usize,
    pub clients: Vec<ConnectionInfo>,
    pub broker: BrokerStats,
}

/// The relay server.
///
/// Independent instances share nothing, so several can run in one process.
pub struct RelayServer {
    config: ServerConfig,
    broker: Arc<RelayBroker>,
}

impl RelayServer {
    /// Create a new relay with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            broker: Arc::new(RelayBroker::new(Arc::new(ConnectionRegistry::new()))),
        }
    }

    /// Create with default configuration (all interfaces, port 30026).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve in the background.
    ///
    /// The returned handle reports the bound address and stops the relay.
    pub async fn start(&self) -> Result<ServerHandle, BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Relay server listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker = self.broker.clone();
        let task = tokio::spawn(Self::accept_loop(listener, broker.clone(), shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            broker,
            shutdown_tx,
            task,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        broker: Arc<RelayBroker>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            let broker = broker.clone();
                            let shutdown_rx = shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, addr, broker, shutdown_rx).await
                                {
                                    log::error!("Connection error from {addr}: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                        }
                    }
                }
                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                _ = shutdown_rx.changed() => {
                    log::info!("Relay server stopped accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                log::error!("Connection task ended abnormally: {e}");
            }
        }
        log::info!("All relay connections closed");
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broker: Arc<RelayBroker>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio::select! {
            ws = tokio_tungstenite::accept_async(stream) => ws?,
            _ = shutdown_rx.changed() => return Ok(()),
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (handle, mut outbound_rx) = ConnectionHandle::channel();
        // The outbound queue is drained only after on_open returns, so the
        // greeting hits the wire once the record is registered.
        let id = broker.on_open(handle, addr.to_string()).await;

        let result = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            broker.on_frame(id, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            broker.on_binary(id, data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                                .unwrap_or((1005, String::new()));
                            log::info!("Client {id} closed the connection (code: {code}, reason: {reason})");
                            break Ok(());
                        }
                        None => break Ok(()),
                        Some(Err(e)) => {
                            log::error!("WebSocket error from client {id}: {e}");
                            break Err(e.into());
                        }
                        _ => {}
                    }
                }

                // Outgoing queued message
                out = outbound_rx.recv() => {
                    let Some(out) = out else { break Ok(()) };
                    if let Err(e) = ws_sender.send(out).await {
                        log::error!("Write to client {id} failed: {e}");
                        break Err(e.into());
                    }
                }

                _ = shutdown_rx.changed() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Server shutting down".into(),
                    }));
                    let _ = ws_sender.send(close).await;
                    break Ok(());
                }
            }
        };

        // The record never outlives its transport.
        broker.on_close(id).await;
        result
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// A running relay.
pub struct ServerHandle {
    local_addr: SocketAddr,
    broker: Arc<RelayBroker>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Current port, clients and broker counters.
    pub async fn status(&self) -> ServerStatus {
        let clients = self.broker.registry().snapshot().await;
        ServerStatus {
            port: self.local_addr.port(),
            client_count: clients.len(),
            clients,
            broker: self.broker.stats(),
        }
    }

    /// Stop accepting, close every client with 1000 "Server shutting down",
    /// and wait until every connection task has finished.
    pub async fn stop(self) {
        log::info!("Stopping relay server...");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            log::error!("Accept loop ended abnormally: {e}");
        }
    }
}
