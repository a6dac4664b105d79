//! Error types for jobstream.

use std::time::Duration;

use thiserror::Error;

use crate::stream::SubscriptionHandle;

/// Transient failure of a single stream connection.
///
/// These are recovered by the reconnect loop and only become visible to the
/// caller as the cause attached to a state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The HTTP request could not be sent or the connection dropped.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status.
    #[error("server responded with HTTP {0}")]
    Status(u16),

    /// The server answered with something other than an event stream.
    #[error("unexpected content type: {0}")]
    ContentType(String),

    /// Reading the response body failed.
    #[error("stream read failed: {0}")]
    Body(String),

    /// An event exceeded the framing limits.
    #[error("invalid event framing: {0}")]
    Framing(String),

    /// The server ended the stream.
    #[error("stream closed by server")]
    Closed,

    /// No liveness signal arrived in time.
    #[error("no heartbeat within {0:?}")]
    HeartbeatTimeout(Duration),
}

/// Terminal failure after the reconnect budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gave up after {attempts} reconnect attempts: {last_error}")]
pub struct FatalError {
    /// Reconnect attempts made before giving up.
    pub attempts: u32,
    /// The failure that exhausted the budget.
    pub last_error: TransportError,
}

/// Errors returned by the public client API.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream URL is not a usable http(s) URL.
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),

    /// The handle does not name a live subscription.
    #[error("unknown subscription handle: {0}")]
    UnknownHandle(SubscriptionHandle),

    /// The subscription was disconnected while waiting on it.
    #[error("subscription {0} was disconnected")]
    Disconnected(SubscriptionHandle),

    /// Subscribing needs a running tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reconnect attempts were exhausted.
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] jobstream_proto::ProtoError),
}
