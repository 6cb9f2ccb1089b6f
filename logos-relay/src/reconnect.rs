//! Reconnection policy and connection state machine.
//!
//! ```text
//!             begin_attempt()          connected()
//! Disconnected ──────────────► Connecting ──────────► Connected
//!      ▲                           │                      │
//!      │      connection_lost()    │  connection_lost()   │
//!      └───────────────────────────┴──────────────────────┘
//!      │
//!      └── attempts exhausted ──► Failed (terminal)
//! ```
//!
//! The attempt counter counts automatic retries since the last successful
//! connection and resets to zero on every `connected()`.

use std::time::Duration;

/// Default delay before an automatic reconnect.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

/// Default number of automatic reconnects before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Attempt budget exhausted; no further automatic attempts
    Failed,
}

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// What the session should do after losing (or failing to open) a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; the state machine is now `Failed`
    GiveUp { attempts: u32 },
    /// The caller closed the session; do nothing
    Stop,
}

/// Connection lifecycle state machine for one session.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    closed: bool,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Automatic retries made since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the caller has closed this session.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Enter `Connecting`. Returns false if the session is closed or failed.
    pub fn begin_attempt(&mut self) -> bool {
        if self.closed || self.state == ConnectionState::Failed {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// The transport opened.
    pub fn connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// The transport closed, errored or could not be opened.
    pub fn connection_lost(&mut self) -> ReconnectDecision {
        if self.closed {
            self.state = ConnectionState::Disconnected;
            return ReconnectDecision::Stop;
        }
        if self.state == ConnectionState::Failed {
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        if self.attempts < self.policy.max_attempts {
            self.attempts += 1;
            self.state = ConnectionState::Disconnected;
            ReconnectDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.interval,
            }
        } else {
            self.state = ConnectionState::Failed;
            ReconnectDecision::GiveUp {
                attempts: self.attempts,
            }
        }
    }

    /// The caller closed the session. Terminal for this instance, but not a
    /// failure.
    pub fn closed_by_caller(&mut self) -> ReconnectDecision {
        self.closed = true;
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
        ReconnectDecision::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    #[test]
    fn test_defaults() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.interval, Duration::from_millis(3000));
        assert_eq!(p.max_attempts, 10);
        assert_eq!(Reconnector::new(p).state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_happy_path() {
        let mut r = Reconnector::new(policy(3));
        assert!(r.begin_attempt());
        assert_eq!(r.state(), ConnectionState::Connecting);
        r.connected();
        assert_eq!(r.state(), ConnectionState::Connected);
        assert_eq!(r.attempts(), 0);
    }

    #[test]
    fn test_gives_up_after_budget() {
        let mut r = Reconnector::new(policy(10));
        for expected in 1..=10 {
            assert!(r.begin_attempt());
            assert_eq!(
                r.connection_lost(),
                ReconnectDecision::Retry {
                    attempt: expected,
                    delay: Duration::from_millis(5)
                }
            );
        }
        assert!(r.begin_attempt());
        assert_eq!(r.connection_lost(), ReconnectDecision::GiveUp { attempts: 10 });
        assert_eq!(r.state(), ConnectionState::Failed);

        // Terminal: no further attempts.
        assert!(!r.begin_attempt());
        assert_eq!(r.connection_lost(), ReconnectDecision::GiveUp { attempts: 10 });
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut r = Reconnector::new(policy(2));
        r.begin_attempt();
        r.connection_lost();
        r.begin_attempt();
        r.connection_lost();
        assert_eq!(r.attempts(), 2);

        r.begin_attempt();
        r.connected();
        assert_eq!(r.attempts(), 0);
        assert!(matches!(
            r.connection_lost(),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_caller_close_suppresses_retry() {
        let mut r = Reconnector::new(policy(5));
        r.begin_attempt();
        r.connected();
        assert_eq!(r.closed_by_caller(), ReconnectDecision::Stop);
        assert_eq!(r.connection_lost(), ReconnectDecision::Stop);
        assert_eq!(r.state(), ConnectionState::Disconnected);
        assert!(!r.begin_attempt());
        assert!(r.is_closed());
    }

    #[test]
    fn test_zero_budget_fails_on_first_loss() {
        let mut r = Reconnector::new(policy(0));
        r.begin_attempt();
        assert_eq!(r.connection_lost(), ReconnectDecision::GiveUp { attempts: 0 });
    }
}
