//! Connection state types.

use std::fmt;
use std::time::Duration;

use crate::error::{FatalError, TransportError};

/// State of a stream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected. Terminal after a manual disconnect or an exhausted
    /// reconnect budget.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, events flowing.
    Connected,
    /// Connection lost, waiting out the backoff delay.
    Reconnecting,
}

impl ConnectionState {
    /// Short lowercase name for logs and status displays.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published status of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub attempts: u32,
    /// Set when the reconnect budget ran out.
    pub fatal: Option<FatalError>,
}

impl ConnectionStatus {
    pub(crate) const fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            fatal: None,
        }
    }

    /// Check if the subscription gave up reconnecting.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}

/// A transition of the connection state machine, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub current: ConnectionState,
    /// Reconnect attempts counted so far.
    pub attempts: u32,
    /// Delay before the scheduled reconnect, when entering `Reconnecting`.
    pub retry_in: Option<Duration>,
    /// The transient failure that caused the transition, if any.
    pub cause: Option<TransportError>,
    /// Set when entering the terminal state after exhausting reconnects.
    pub fatal: Option<FatalError>,
}

impl StateChange {
    pub(crate) const fn new(previous: ConnectionState, current: ConnectionState, attempts: u32) -> Self {
        Self {
            previous,
            current,
            attempts,
            retry_in: None,
            cause: None,
            fatal: None,
        }
    }

    pub(crate) const fn with_retry_in(mut self, delay: Duration) -> Self {
        self.retry_in = Some(delay);
        self
    }

    pub(crate) fn with_cause(mut self, cause: TransportError) -> Self {
        self.cause = Some(cause);
        self
    }

    pub(crate) fn with_fatal(mut self, fatal: FatalError) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// The status this transition leaves behind.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.current,
            attempts: self.attempts,
            fatal: self.fatal.clone(),
        }
    }
}
