//! Peer-side connector for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - `doc` / `ephemeral` send path for opaque engine updates
//! - An event stream of inbound messages and lifecycle transitions
//! - Keep-alive pings while connected
//!
//! One supervisor task per session owns the socket. The heartbeat and the
//! `send_*` calls only push onto the current connection's outbound queue,
//! so they interleave freely with inbound delivery.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::heartbeat::{Heartbeat, DEFAULT_HEARTBEAT_PERIOD};
use crate::protocol::{ProtocolError, RelayMessage, UpdateKind, UpdatePayload, DEFAULT_PORT};
use crate::reconnect::{ConnectionState, ReconnectDecision, ReconnectPolicy, Reconnector};

const CLIENT_CLOSE_REASON: &str = "Client initiated disconnect";

/// Close code reported when the socket dropped or never opened.
const ABNORMAL_CLOSE: u16 = 1006;

/// Where the session runs, for picking the loopback address of the host
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Shares the host loopback interface
    Host,
    /// Android emulator; the host is reachable at 10.0.2.2
    AndroidEmulator,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::AndroidEmulator
        } else {
            Self::Host
        }
    }

    pub fn loopback_host(&self) -> &'static str {
        match self {
            Self::Host => "localhost",
            Self::AndroidEmulator => "10.0.2.2",
        }
    }
}

/// Default relay URL for a platform.
pub fn default_server_url(platform: Platform, port: u16) -> String {
    format!("ws://{}:{port}", platform.loopback_host())
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL
    pub url: String,
    /// Stable peer id; generated when `None`
    pub peer_id: Option<String>,
    /// Period between keep-alive pings
    pub heartbeat_period: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(Platform::current(), DEFAULT_PORT),
            peer_id: None,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport opened
    Connected,
    /// The relay assigned this connection an id
    ClientIdAssigned(u64),
    /// Document update from another peer
    Doc(UpdatePayload),
    /// Ephemeral update from another peer
    Ephemeral(UpdatePayload),
    /// Reply to one of our pings
    Pong { timestamp: i64 },
    /// Transport closed, or a connect attempt failed (code 1006)
    Disconnected { code: u16, reason: String },
    /// Transport or connect error; reconnection follows unless exhausted
    Error(String),
    /// Reconnect budget exhausted. Emitted once; the session is done.
    Failed { attempts: u32 },
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub peer_id: String,
    pub client_id: Option<u64>,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub state: ConnectionState,
}

/// Mutable state shared between the session and its supervisor task.
struct SessionState {
    reconnector: Reconnector,
    client_id: Option<u64>,
    /// Outbound queue of the open connection, if any
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl SessionState {
    fn is_connected(&self) -> bool {
        self.outbound.is_some() && self.reconnector.state() == ConnectionState::Connected
    }
}

type SharedState = Arc<RwLock<SessionState>>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One peer's logical connection to the relay.
///
/// The peer id is fixed for the life of the session and survives
/// reconnects; the relay-assigned client id does not.
pub struct PeerSession {
    config: ClientConfig,
    peer_id: String,
    state: SharedState,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Create a new session. Nothing connects until [`PeerSession::connect`].
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = config
            .peer_id
            .clone()
            .unwrap_or_else(|| format!("peer_{}", Uuid::new_v4().simple()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(SessionState {
                reconnector: Reconnector::new(config.reconnect),
                client_id: None,
                outbound: None,
            })),
            config,
            peer_id,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            supervisor: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Start the connection supervisor and wait for the first attempt.
    ///
    /// A failed first attempt is returned as an error, but the supervisor
    /// keeps retrying per the reconnect policy.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.state.read().await.reconnector.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let (first_tx, first_rx) = oneshot::channel();
        let supervisor = Supervisor {
            config: self.config.clone(),
            peer_id: self.peer_id.clone(),
            state: self.state.clone(),
            events: self.event_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            first_result: Some(first_tx),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));

        first_rx.await.unwrap_or(Err(ProtocolError::ConnectionClosed))
    }

    /// Send a document update. Returns false if it was not queued.
    pub async fn send_doc(&self, doc_id: &str, update: impl Into<Vec<u8>>) -> bool {
        self.send_update(UpdateKind::Doc, doc_id, update.into()).await
    }

    /// Send an ephemeral update. Returns false if it was not queued.
    pub async fn send_ephemeral(&self, doc_id: &str, update: impl Into<Vec<u8>>) -> bool {
        self.send_update(UpdateKind::Ephemeral, doc_id, update.into()).await
    }

    async fn send_update(&self, kind: UpdateKind, doc_id: &str, update: Vec<u8>) -> bool {
        let outbound = {
            let state = self.state.read().await;
            match &state.outbound {
                Some(tx) if state.is_connected() => tx.clone(),
                _ => {
                    log::warn!("Cannot send {kind} message: not connected to server");
                    return false;
                }
            }
        };

        if doc_id.is_empty() || update.is_empty() {
            log::error!("Cannot send {kind} message: docId and update are required");
            return false;
        }

        let msg = match kind {
            UpdateKind::Doc => RelayMessage::doc(doc_id, update, self.peer_id.as_str()),
            UpdateKind::Ephemeral => RelayMessage::ephemeral(doc_id, update, self.peer_id.as_str()),
        };
        let text = match msg.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Error encoding {kind} message: {e}");
                return false;
            }
        };

        match outbound.send(Message::text(text)) {
            Ok(()) => {
                log::debug!("Sent {kind} message for doc '{doc_id}'");
                true
            }
            Err(_) => {
                log::error!("Error sending {kind} message: connection closed");
                false
            }
        }
    }

    /// Current session status.
    pub async fn status(&self) -> SessionStatus {
        let state = self.state.read().await;
        SessionStatus {
            peer_id: self.peer_id.clone(),
            client_id: state.client_id,
            connected: state.is_connected(),
            reconnect_attempts: state.reconnector.attempts(),
            state: state.reconnector.state(),
        }
    }

    /// Close the session for good.
    ///
    /// Stops the heartbeat, closes the socket with 1000 and suppresses
    /// reconnection. A closed session cannot be reconnected; create a new one.
    pub async fn disconnect(&mut self) {
        log::info!("Disconnecting from relay server...");
        {
            let mut state = self.state.write().await;
            state.reconnector.closed_by_caller();
            state.outbound = None;
            state.client_id = None;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.supervisor.take() {
            if let Err(e) = task.await {
                log::error!("Session supervisor ended abnormally: {e}");
            }
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}

/// Connection loop of one session: connect, serve, decide, repeat.
struct Supervisor {
    config: ClientConfig,
    peer_id: String,
    state: SharedState,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown_rx: watch::Receiver<bool>,
    first_result: Option<oneshot::Sender<Result<(), ProtocolError>>>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            if !self.state.write().await.reconnector.begin_attempt() {
                break;
            }

            log::info!("Connecting to relay server: {}", self.config.url);
            let attempt = tokio::select! {
                result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result,
                _ = self.shutdown_rx.changed() => break,
            };

            match attempt {
                Ok((ws_stream, _)) => self.serve(ws_stream).await,
                Err(e) => {
                    log::error!("Failed to connect to {}: {e}", self.config.url);
                    let _ = self.events.send(SessionEvent::Error(e.to_string()));
                    let _ = self.events.send(SessionEvent::Disconnected {
                        code: ABNORMAL_CLOSE,
                        reason: e.to_string(),
                    });
                    self.report_first(Err(ProtocolError::Connect(e.to_string())));
                }
            }

            let decision = self.state.write().await.reconnector.connection_lost();
            match decision {
                ReconnectDecision::Retry { attempt, delay } => {
                    log::info!(
                        "Attempting to reconnect ({attempt}/{}) in {}ms",
                        self.config.reconnect.max_attempts,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
                ReconnectDecision::GiveUp { attempts } => {
                    log::error!("Max reconnection attempts reached ({attempts}). Giving up.");
                    let _ = self.events.send(SessionEvent::Failed { attempts });
                    break;
                }
                ReconnectDecision::Stop => break,
            }
        }
        self.report_first(Err(ProtocolError::ConnectionClosed));
    }

    fn report_first(&mut self, result: Result<(), ProtocolError>) {
        if let Some(tx) = self.first_result.take() {
            let _ = tx.send(result);
        }
    }

    /// Serve one open connection until it closes.
    ///
    /// The first `connect()` resolves only once the session is marked
    /// connected and the heartbeat runs.
    async fn serve(&mut self, ws_stream: WsStream) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        {
            let mut state = self.state.write().await;
            state.reconnector.connected();
            state.outbound = Some(out_tx.clone());
        }
        log::info!("Connected to relay server");
        let _ = self.events.send(SessionEvent::Connected);

        let mut heartbeat = Heartbeat::start(
            self.peer_id.as_str(),
            out_tx,
            self.config.heartbeat_period,
        );
        self.report_first(Ok(()));

        let (code, reason) = loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_str()).await,
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Ignoring {}-byte binary frame from relay", data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                                .unwrap_or((1005, String::new()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error: {e}");
                            let _ = self.events.send(SessionEvent::Error(e.to_string()));
                            break (ABNORMAL_CLOSE, e.to_string());
                        }
                        None => break (ABNORMAL_CLOSE, "Connection lost".to_string()),
                    }
                }

                out = out_rx.recv() => {
                    let Some(out) = out else {
                        break (ABNORMAL_CLOSE, "Outbound queue closed".to_string());
                    };
                    if let Err(e) = ws_sender.send(out).await {
                        log::error!("Write to relay failed: {e}");
                        let _ = self.events.send(SessionEvent::Error(e.to_string()));
                        break (ABNORMAL_CLOSE, e.to_string());
                    }
                }

                _ = self.shutdown_rx.changed() => {
                    heartbeat.stop();
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: CLIENT_CLOSE_REASON.into(),
                    }));
                    let _ = ws_sender.send(close).await;
                    break (1000, CLIENT_CLOSE_REASON.to_string());
                }
            }
        };

        // Heartbeat goes first so nothing is queued onto a dead socket.
        heartbeat.stop();
        {
            let mut state = self.state.write().await;
            state.outbound = None;
            state.client_id = None;
        }
        let _ = ws_sender.close().await;

        log::info!("Relay connection closed: {code} - {reason}");
        let _ = self.events.send(SessionEvent::Disconnected { code, reason });
    }

    async fn handle_inbound(&self, text: &str) {
        let msg = match RelayMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Error parsing message from relay: {e}");
                return;
            }
        };
        log::debug!("Received message: {}", msg.tag());

        let event = match msg {
            RelayMessage::Connected { client_id, .. } => {
                self.state.write().await.client_id = Some(client_id);
                log::info!("Assigned client ID: {client_id}");
                SessionEvent::ClientIdAssigned(client_id)
            }
            RelayMessage::Pong { timestamp } => SessionEvent::Pong { timestamp },
            RelayMessage::Doc(payload) => {
                log::debug!(
                    "Received doc message for doc '{}' from peer '{}'",
                    payload.doc_id,
                    payload.peer_id
                );
                SessionEvent::Doc(payload)
            }
            RelayMessage::Ephemeral(payload) => SessionEvent::Ephemeral(payload),
            RelayMessage::Ping { .. } => {
                log::warn!("Unexpected ping from relay");
                return;
            }
        };
        let _ = self.events.send(event);
    }
}
