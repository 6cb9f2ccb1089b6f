//! Client keep-alive.
//!
//! A [`Heartbeat`] pushes one `ping` onto the connection's outbound queue as
//! soon as it starts and then one per period. It never judges liveness:
//! connection loss is detected by the socket closing, not by missing pongs.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::RelayMessage;

/// Default period between pings.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Running ping timer tied to one connection.
///
/// Stopping or dropping it cancels the timer task.
#[derive(Debug)]
pub struct Heartbeat {
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Start pinging on `outbound` every `period`, beginning immediately.
    ///
    /// A zero period falls back to [`DEFAULT_HEARTBEAT_PERIOD`].
    pub fn start(
        peer_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<Message>,
        period: Duration,
    ) -> Self {
        let period = if period.is_zero() {
            log::warn!(
                "Zero heartbeat period, using {}s",
                DEFAULT_HEARTBEAT_PERIOD.as_secs()
            );
            DEFAULT_HEARTBEAT_PERIOD
        } else {
            period
        };
        let peer_id = peer_id.into();
        let task = tokio::spawn(async move {
            // First tick completes immediately.
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let text = match RelayMessage::ping(peer_id.as_str()).encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode ping: {e}");
                        continue;
                    }
                };
                if outbound.send(Message::text(text)).is_err() {
                    log::debug!("Heartbeat outbound queue closed");
                    break;
                }
                log::trace!("Sent ping to server");
            }
        });
        log::debug!("Heartbeat started, sending ping every {}s", period.as_secs_f32());
        Self { task: Some(task) }
    }

    /// Cancel the timer. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
